pub mod remux;
pub mod segments;

pub use remux::{write_input_reference, RemuxPipeline, RemuxSettings};
pub use segments::{
    is_valid_segment_name, manifest_has_segments, prune_segments, rewrite_manifest, uri_component,
    HlsLayout,
};
