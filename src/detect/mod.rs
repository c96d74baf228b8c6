// Segment filename inspection: capture timestamps embedded in upload URLs.

pub mod segment_name;
