mod endpoints;
mod registry;
mod styles;

pub use endpoints::EndpointRef;
pub use registry::{EffectDescriptor, EffectRegistry, InputKind};
pub use styles::{append_style, style_preset, StylePreset, STYLE_PRESETS};
