#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StylePreset {
    pub name: &'static str,
    pub prompt: &'static str,
}

pub const STYLE_PRESETS: &[StylePreset] = &[
    StylePreset {
        name: "Cinematic",
        prompt: "cinematic lighting, 8k, highly detailed, realistic",
    },
    StylePreset {
        name: "Cyberpunk",
        prompt: "neon lights, futuristic, cyberpunk city, dark atmosphere",
    },
    StylePreset {
        name: "Anime",
        prompt: "anime style, vibrant colors, studio ghibli inspired",
    },
    StylePreset {
        name: "Oil Painting",
        prompt: "oil painting texture, brush strokes, artistic",
    },
    StylePreset {
        name: "Vintage",
        prompt: "vintage 90s camcorder style, vhs glitch, retro",
    },
    StylePreset {
        name: "Bullet Time",
        prompt: "bullet time, frozen action, 360 degree rotation, matrix style",
    },
];

/// Looks a preset up by name, ignoring case and `-`/`_` versus spaces.
pub fn style_preset(name: &str) -> Option<&'static StylePreset> {
    let wanted = normalize_style_name(name);
    STYLE_PRESETS
        .iter()
        .find(|preset| normalize_style_name(preset.name) == wanted)
}

pub fn append_style(prompt: &str, phrase: &str) -> String {
    let current = prompt.trim_end();
    if current.trim().is_empty() {
        return phrase.to_string();
    }
    format!("{current}, {phrase}")
}

fn normalize_style_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['-', '_'], " ")
}
