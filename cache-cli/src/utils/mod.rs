mod headers;
mod time;

pub use self::headers::split_header;
pub use self::time::parse_duration;
