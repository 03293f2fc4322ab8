mod stream_proxy_extractor;

pub use stream_proxy_extractor::*;
