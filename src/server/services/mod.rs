pub mod catalog_services;
pub mod edge_services;
pub mod epg_services;
pub mod fetch_services;
pub mod snapshot_services;
pub mod transport_services;

pub use catalog_services::DynCatalogService;
pub use epg_services::DynGuideService;
pub use transport_services::DynHttpTransport;
