pub mod guide_dto;
pub mod health_dto;
