pub mod encoding_utils;
pub mod m3u_utils;
pub mod manifest_utils;
pub mod xmltv_utils;
