use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::endpoints::EndpointRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Image,
    Video,
}

impl InputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    /// Image and video effects take an uploaded file as their primary input.
    pub fn takes_file(self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub model_id: String,
    pub input_kind: InputKind,
    pub requires_prompt: bool,
    pub default_prompt: Option<String>,
    pub icon: String,
    pub endpoints: Vec<EndpointRef>,
}

impl EffectDescriptor {
    /// Text effects always take a prompt; file effects only when flagged.
    pub fn takes_prompt(&self) -> bool {
        self.input_kind == InputKind::Text || self.requires_prompt
    }
}

#[derive(Debug, Clone)]
pub struct EffectRegistry {
    effects: IndexMap<String, EffectDescriptor>,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EffectRegistry {
    pub fn new(effects: Option<IndexMap<String, EffectDescriptor>>) -> Self {
        Self {
            effects: effects.unwrap_or_else(default_effects),
        }
    }

    pub fn get(&self, id: &str) -> Option<&EffectDescriptor> {
        self.effects.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &EffectDescriptor> {
        self.effects.values()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Distinct categories in order of first appearance.
    pub fn categories(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for effect in self.effects.values() {
            if !out.contains(&effect.category) {
                out.push(effect.category.clone());
            }
        }
        out
    }

    pub fn in_category(&self, category: &str) -> Vec<&EffectDescriptor> {
        self.effects
            .values()
            .filter(|effect| effect.category.eq_ignore_ascii_case(category))
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (key, effect) in &self.effects {
            if key != &effect.id {
                return Err(format!(
                    "Effect keyed '{key}' carries mismatched id '{}'.",
                    effect.id
                ));
            }
            if effect.model_id.trim().is_empty() {
                return Err(format!("Effect '{key}' has no target model."));
            }
            if effect.endpoints.is_empty() {
                return Err(format!("Effect '{key}' has no candidate endpoints."));
            }
        }
        Ok(())
    }
}

fn default_endpoints() -> Vec<EndpointRef> {
    vec![
        EndpointRef::named("/infer"),
        EndpointRef::named("/predict"),
        EndpointRef::Index(0),
    ]
}

fn default_effects() -> IndexMap<String, EffectDescriptor> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str,
                      name: &str,
                      description: &str,
                      category: &str,
                      model_id: &str,
                      input_kind: InputKind,
                      default_prompt: Option<&str>,
                      icon: &str| {
        map.insert(
            id.to_string(),
            EffectDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                category: category.to_string(),
                model_id: model_id.to_string(),
                input_kind,
                requires_prompt: input_kind == InputKind::Video,
                default_prompt: default_prompt.map(str::to_string),
                icon: icon.to_string(),
                endpoints: default_endpoints(),
            },
        );
    };

    insert(
        "text-to-video",
        "Text to Video",
        "Generate video FAST (AnimateDiff Lightning).",
        "Generation",
        "ByteDance/AnimateDiff-Lightning",
        InputKind::Text,
        None,
        "Film",
    );
    insert(
        "image-to-video",
        "Image to Video",
        "Bring still photos to life.",
        "Generation",
        "stabilityai/stable-video-diffusion-img2vid-xt-1-1",
        InputKind::Image,
        None,
        "ImagePlay",
    );
    insert(
        "slow-motion",
        "Super Slow Motion",
        "Smooth out videos (Zeroscope V2).",
        "Effects",
        "cerspense/zeroscope_v2_576w",
        InputKind::Video,
        Some("slow motion, smooth, high frame rate"),
        "Clock",
    );
    insert(
        "bullet-time",
        "Bullet Time",
        "Frozen orbit effect (Matrix Style).",
        "Effects",
        "cerspense/zeroscope_v2_576w",
        InputKind::Video,
        Some("bullet time, matrix style, 360 orbit, frozen action"),
        "Zap",
    );
    insert(
        "threed-parallax",
        "3D Parallax",
        "Transform images into 3D video.",
        "Effects",
        "Google/zoe-depth",
        InputKind::Image,
        None,
        "Move",
    );
    insert(
        "video-styles",
        "AI Video Styles",
        "Apply Anime, Cyberpunk, etc. to video.",
        "Effects",
        "cerspense/zeroscope_v2_576w",
        InputKind::Video,
        None,
        "Wand2",
    );
    insert(
        "text-to-image",
        "Text to Image",
        "FLUX.1 High Quality Generation.",
        "Generation",
        "black-forest-labs/FLUX.1-schnell",
        InputKind::Text,
        None,
        "ImageIcon",
    );
    insert(
        "remove-bg",
        "Remove Background",
        "Transparent background in seconds.",
        "Editing",
        "briaai/RMBG-1.4",
        InputKind::Image,
        None,
        "Scissors",
    );
    insert(
        "dolly-zoom",
        "Dolly Zoom",
        "Cinematic vertigo effect for images.",
        "Effects",
        "Google/zoe-depth",
        InputKind::Image,
        None,
        "MoveDiagonal",
    );
    insert(
        "upscale",
        "4K Upscale",
        "Enhance resolution and quality.",
        "Editing",
        "sczhou/CodeFormer",
        InputKind::Image,
        None,
        "Maximize",
    );

    // The background remover Space publishes its function as /process_image.
    if let Some(effect) = map.get_mut("remove-bg") {
        effect.endpoints.insert(0, EndpointRef::named("/process_image"));
    }

    map
}
