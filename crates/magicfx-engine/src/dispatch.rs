use std::path::PathBuf;

use log::{debug, info, warn};
use magicfx_contracts::effects::{EffectDescriptor, EndpointRef, InputKind};
use magicfx_contracts::events::EventSink;
use rand::Rng;
use serde_json::{json, Value};

use crate::session::{Invoke, SessionError, SessionState};
use crate::transport::Argument;

/// Seeds are drawn uniformly from `0..SEED_RANGE`.
pub const SEED_RANGE: u64 = 1_000_000;

/// How an effect's positional arguments are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentShape {
    /// `[prompt, seed, randomize_seed, width, height, steps]`
    PromptSeedCanvas,
    /// `[prompt, seed]`
    PromptSeed,
    /// `[file, seed, frames, motion_bucket, fps, noise_aug]`
    FileSeedMotion,
    /// `[file, prompt, seed]`
    FilePromptSeed,
    /// `[file]`
    FileOnly,
}

impl ArgumentShape {
    pub fn takes_file(self) -> bool {
        !matches!(self, Self::PromptSeedCanvas | Self::PromptSeed)
    }

    pub fn takes_prompt(self) -> bool {
        matches!(
            self,
            Self::PromptSeedCanvas | Self::PromptSeed | Self::FilePromptSeed
        )
    }

    pub fn takes_seed(self) -> bool {
        !matches!(self, Self::FileOnly)
    }
}

pub const ARGUMENT_TABLE: &[(&str, ArgumentShape)] = &[
    ("text-to-image", ArgumentShape::PromptSeedCanvas),
    ("text-to-video", ArgumentShape::PromptSeed),
    ("image-to-video", ArgumentShape::FileSeedMotion),
    ("slow-motion", ArgumentShape::FilePromptSeed),
    ("bullet-time", ArgumentShape::FilePromptSeed),
    ("video-styles", ArgumentShape::FilePromptSeed),
    ("threed-parallax", ArgumentShape::FileOnly),
    ("remove-bg", ArgumentShape::FileOnly),
    ("dolly-zoom", ArgumentShape::FileOnly),
    ("upscale", ArgumentShape::FileOnly),
];

pub fn argument_shape(effect: &EffectDescriptor) -> ArgumentShape {
    ARGUMENT_TABLE
        .iter()
        .find(|(id, _)| *id == effect.id)
        .map(|(_, shape)| *shape)
        .unwrap_or(match effect.input_kind {
            InputKind::Video => ArgumentShape::FilePromptSeed,
            _ => ArgumentShape::FileOnly,
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationInput {
    pub prompt: String,
    pub file: Option<PathBuf>,
}

impl GenerationInput {
    /// The typed prompt, or the effect's default when nothing was typed.
    pub fn effective_prompt(&self, effect: &EffectDescriptor) -> String {
        let typed = self.prompt.trim();
        if !typed.is_empty() {
            return typed.to_string();
        }
        effect
            .default_prompt
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("{effect} needs an input file")]
    MissingFile { effect: String },
    #[error("{effect} needs a prompt")]
    MissingPrompt { effect: String },
    #[error("{effect} takes a text prompt, not a file")]
    FileNotAccepted { effect: String },
    #[error("input file {path} does not exist")]
    FileNotFound { path: PathBuf },
    #[error("{path} is not a readable image: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },
}

/// One failed candidate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttempt {
    pub endpoint: EndpointRef,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("Client not ready (session is {state})")]
    NotReady { state: SessionState },
    #[error("Failed to run {effect}. The model might be busy or expects different inputs.")]
    AllEndpointsFailed {
        effect: String,
        attempts: Vec<EndpointAttempt>,
    },
    #[error("No usable result returned by the model.")]
    NoUsableResult,
}

impl DispatchError {
    /// Per-endpoint diagnostics for an exhausted fallback chain.
    pub fn attempts(&self) -> &[EndpointAttempt] {
        match self {
            Self::AllEndpointsFailed { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub effect_id: String,
    pub endpoint: EndpointRef,
    pub seed: Option<u64>,
    pub media: Value,
}

impl GenerationResult {
    /// The media location, when the result carries one.
    pub fn media_url(&self) -> Option<&str> {
        if let Some(text) = self.media.as_str() {
            return Some(text);
        }
        ["url", "path"]
            .iter()
            .find_map(|key| self.media.get(*key).and_then(Value::as_str))
            .filter(|value| !value.is_empty())
    }

    pub fn display_text(&self) -> String {
        match self.media_url() {
            Some(url) => url.to_string(),
            None => self.media.to_string(),
        }
    }
}

pub fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..SEED_RANGE)
}

/// Builds the positional arguments for `effect`.
pub fn build_arguments(
    effect: &EffectDescriptor,
    input: &GenerationInput,
    seed: u64,
) -> Result<Vec<Argument>, InputError> {
    let shape = argument_shape(effect);
    let prompt = input.effective_prompt(effect);
    if (shape.takes_prompt() || effect.takes_prompt()) && prompt.is_empty() {
        return Err(InputError::MissingPrompt {
            effect: effect.name.clone(),
        });
    }
    let file = input.file.clone().map(Argument::File);

    let args = match (shape, file) {
        (ArgumentShape::PromptSeedCanvas, _) => vec![
            Argument::value(prompt),
            Argument::value(seed),
            Argument::value(true),
            Argument::value(1024),
            Argument::value(1024),
            Argument::value(4),
        ],
        (ArgumentShape::PromptSeed, _) => vec![Argument::value(prompt), Argument::value(seed)],
        (ArgumentShape::FileSeedMotion, Some(file)) => vec![
            file,
            Argument::value(seed),
            Argument::value(25),
            Argument::value(127),
            Argument::value(6),
            Argument::value(0.02),
        ],
        (ArgumentShape::FilePromptSeed, Some(file)) => {
            vec![file, Argument::value(prompt), Argument::value(seed)]
        }
        (ArgumentShape::FileOnly, Some(file)) => vec![file],
        (_, None) => {
            return Err(InputError::MissingFile {
                effect: effect.name.clone(),
            })
        }
    };
    Ok(args)
}

/// Takes the first element of `data` and picks its `url`, `video` or `image`
/// member, falling back to the element itself.
pub fn extract_result(response: &Value) -> Result<Value, DispatchError> {
    let Some(first) = response
        .get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .filter(|value| is_truthy(value))
    else {
        return Err(DispatchError::NoUsableResult);
    };
    for key in ["url", "video", "image"] {
        if let Some(value) = first.get(key).filter(|value| is_truthy(value)) {
            return Ok(value.clone());
        }
    }
    Ok(first.clone())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Runs an effect over its candidate endpoints in order.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    events: EventSink,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: impl Into<EventSink>) -> Self {
        self.events = events.into();
        self
    }

    pub fn run(
        &self,
        session: &dyn Invoke,
        effect: &EffectDescriptor,
        input: &GenerationInput,
    ) -> Result<GenerationResult, DispatchError> {
        self.run_with_seed(session, effect, input, random_seed())
    }

    pub fn run_with_seed(
        &self,
        session: &dyn Invoke,
        effect: &EffectDescriptor,
        input: &GenerationInput,
        seed: u64,
    ) -> Result<GenerationResult, DispatchError> {
        let args = build_arguments(effect, input, seed)?;
        let seed = argument_shape(effect).takes_seed().then_some(seed);
        debug!(
            "{} arguments: {}",
            effect.id,
            Value::Array(args.iter().map(Argument::describe).collect())
        );

        let mut attempts = Vec::new();
        for endpoint in &effect.endpoints {
            match session.invoke(endpoint, &args) {
                Ok(response) => {
                    let media = extract_result(&response)?;
                    info!("{} answered on {endpoint}", effect.id);
                    return Ok(GenerationResult {
                        effect_id: effect.id.clone(),
                        endpoint: endpoint.clone(),
                        seed,
                        media,
                    });
                }
                Err(SessionError::NotReady { state }) => {
                    return Err(DispatchError::NotReady { state });
                }
                Err(SessionError::Transport(err)) => {
                    let error = format!("{err:#}");
                    warn!("{} failed on {endpoint}: {error}", effect.id);
                    self.events.emit(
                        "endpoint_failed",
                        json!({
                            "effect_id": effect.id,
                            "endpoint": endpoint.to_string(),
                            "error": error,
                        }),
                    );
                    attempts.push(EndpointAttempt {
                        endpoint: endpoint.clone(),
                        error,
                    });
                }
            }
        }

        Err(DispatchError::AllEndpointsFailed {
            effect: effect.name.clone(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use magicfx_contracts::effects::{EffectDescriptor, EffectRegistry, EndpointRef, InputKind};
    use serde_json::{json, Value};

    use super::{
        argument_shape, build_arguments, extract_result, random_seed, ArgumentShape,
        DispatchError, Dispatcher, GenerationInput, InputError, ARGUMENT_TABLE, SEED_RANGE,
    };
    use crate::session::{Invoke, SessionError, SessionState};
    use crate::transport::Argument;

    type Reply = Result<Value, SessionError>;

    #[derive(Default)]
    struct ScriptedSession {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<(EndpointRef, Vec<Argument>)>>,
    }

    impl ScriptedSession {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(EndpointRef, Vec<Argument>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Invoke for ScriptedSession {
        fn invoke(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value, SessionError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.clone(), args.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SessionError::Transport(anyhow!("no scripted reply"))))
        }
    }

    fn registry_effect(id: &str) -> EffectDescriptor {
        EffectRegistry::default().get(id).cloned().unwrap()
    }

    fn custom_effect(id: &str, input_kind: InputKind) -> EffectDescriptor {
        EffectDescriptor {
            id: id.to_string(),
            name: "Custom".to_string(),
            description: String::new(),
            category: "Effects".to_string(),
            model_id: "owner/custom".to_string(),
            input_kind,
            requires_prompt: input_kind == InputKind::Video,
            default_prompt: None,
            icon: "Wand2".to_string(),
            endpoints: vec![EndpointRef::Index(0)],
        }
    }

    fn prompt(text: &str) -> GenerationInput {
        GenerationInput {
            prompt: text.to_string(),
            file: None,
        }
    }

    fn with_file(text: &str, path: &str) -> GenerationInput {
        GenerationInput {
            prompt: text.to_string(),
            file: Some(PathBuf::from(path)),
        }
    }

    #[test]
    fn text_to_image_arguments_are_exact() {
        let args = build_arguments(&registry_effect("text-to-image"), &prompt(" a fox "), 42).unwrap();
        assert_eq!(
            args,
            vec![
                Argument::value("a fox"),
                Argument::value(42u64),
                Argument::value(true),
                Argument::value(1024),
                Argument::value(1024),
                Argument::value(4),
            ]
        );
    }

    #[test]
    fn file_effects_put_the_upload_first() {
        let motion = build_arguments(
            &registry_effect("image-to-video"),
            &with_file("", "/tmp/still.png"),
            7,
        )
        .unwrap();
        assert_eq!(motion[0], Argument::File(PathBuf::from("/tmp/still.png")));
        assert_eq!(
            motion[1..].iter().map(Argument::describe).collect::<Vec<_>>(),
            vec![json!(7), json!(25), json!(127), json!(6), json!(0.02)]
        );

        let slow = build_arguments(
            &registry_effect("slow-motion"),
            &with_file("", "/tmp/clip.mp4"),
            9,
        )
        .unwrap();
        assert_eq!(
            slow,
            vec![
                Argument::File(PathBuf::from("/tmp/clip.mp4")),
                Argument::value("slow motion, smooth, high frame rate"),
                Argument::value(9u64),
            ]
        );

        let upscale =
            build_arguments(&registry_effect("upscale"), &with_file("", "/tmp/a.png"), 1).unwrap();
        assert_eq!(upscale, vec![Argument::File(PathBuf::from("/tmp/a.png"))]);
    }

    #[test]
    fn unlisted_effects_fall_back_by_input_kind() {
        let video = custom_effect("mystery-video", InputKind::Video);
        assert_eq!(argument_shape(&video), ArgumentShape::FilePromptSeed);
        let args = build_arguments(&video, &with_file("glow", "/tmp/v.mp4"), 3).unwrap();
        assert_eq!(args.len(), 3);

        let image = custom_effect("mystery-image", InputKind::Image);
        assert_eq!(argument_shape(&image), ArgumentShape::FileOnly);
        assert_eq!(
            build_arguments(&image, &with_file("ignored", "/tmp/i.png"), 3).unwrap(),
            vec![Argument::File(PathBuf::from("/tmp/i.png"))]
        );
    }

    #[test]
    fn every_catalog_effect_has_a_table_entry() {
        let registry = EffectRegistry::default();
        for effect in registry.list() {
            assert!(
                ARGUMENT_TABLE.iter().any(|(id, _)| *id == effect.id),
                "{} missing from argument table",
                effect.id
            );
        }
        assert_eq!(ARGUMENT_TABLE.len(), registry.len());
    }

    #[test]
    fn missing_inputs_are_rejected() {
        assert_eq!(
            build_arguments(&registry_effect("remove-bg"), &prompt(""), 1),
            Err(InputError::MissingFile {
                effect: "Remove Background".to_string()
            })
        );
        assert_eq!(
            build_arguments(&registry_effect("text-to-video"), &prompt("   "), 1),
            Err(InputError::MissingPrompt {
                effect: "Text to Video".to_string()
            })
        );
        assert_eq!(
            build_arguments(
                &registry_effect("video-styles"),
                &with_file("", "/tmp/v.mp4"),
                1
            ),
            Err(InputError::MissingPrompt {
                effect: "AI Video Styles".to_string()
            })
        );
    }

    #[test]
    fn seeds_stay_in_range() {
        for _ in 0..200 {
            assert!(random_seed() < SEED_RANGE);
        }
    }

    #[test]
    fn extraction_prefers_url_then_video_then_image() {
        assert_eq!(
            extract_result(&json!({"data": [{"url": "a.png"}]})).unwrap(),
            json!("a.png")
        );
        assert_eq!(
            extract_result(&json!({"data": [{"video": "b.mp4"}]})).unwrap(),
            json!("b.mp4")
        );
        assert_eq!(
            extract_result(&json!({"data": [{"url": "", "image": "c.webp"}]})).unwrap(),
            json!("c.webp")
        );
        assert_eq!(
            extract_result(&json!({"data": ["https://cdn.test/d.png"]})).unwrap(),
            json!("https://cdn.test/d.png")
        );
        assert_eq!(extract_result(&json!({"data": [{}]})).unwrap(), json!({}));
    }

    #[test]
    fn extraction_rejects_empty_or_falsy_data() {
        for response in [
            json!({"data": []}),
            json!({"data": [null]}),
            json!({"data": [""]}),
            json!({"data": [0]}),
            json!({"other": 1}),
        ] {
            assert!(matches!(
                extract_result(&response),
                Err(DispatchError::NoUsableResult)
            ));
        }
    }

    #[test]
    fn fallback_retries_with_identical_arguments() {
        let session = ScriptedSession::new(vec![
            Err(SessionError::Transport(anyhow!("no endpoint /infer"))),
            Ok(json!({"data": [{"url": "https://cdn.test/out.png"}]})),
        ]);
        let effect = registry_effect("text-to-image");
        let result = Dispatcher::new()
            .run_with_seed(&session, &effect, &prompt("a fox"), 5)
            .unwrap();

        assert_eq!(result.endpoint, EndpointRef::named("/predict"));
        assert_eq!(result.seed, Some(5));
        assert_eq!(result.media_url(), Some("https://cdn.test/out.png"));
        let calls = session.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, EndpointRef::named("/infer"));
        assert_eq!(calls[0].1, calls[1].1);
    }

    #[test]
    fn exhausted_candidates_aggregate_into_one_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let session = ScriptedSession::default();
        let effect = registry_effect("upscale");
        let err = Dispatcher::new()
            .with_events(magicfx_contracts::events::EventWriter::new(&events_path, "t"))
            .run_with_seed(&session, &effect, &with_file("", "/tmp/a.png"), 1)
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed to run 4K Upscale. The model might be busy or expects different inputs."
        );
        assert_eq!(err.attempts().len(), 3);
        assert_eq!(err.attempts()[2].endpoint, EndpointRef::Index(0));
        assert_eq!(session.calls().len(), 3);

        let failures = std::fs::read_to_string(&events_path)?
            .lines()
            .filter(|line| line.contains("\"endpoint_failed\""))
            .count();
        assert_eq!(failures, 3);
        Ok(())
    }

    #[test]
    fn not_ready_stops_the_fallback_chain() {
        let session = ScriptedSession::new(vec![Err(SessionError::NotReady {
            state: SessionState::Connecting,
        })]);
        let err = Dispatcher::new()
            .run_with_seed(&session, &registry_effect("text-to-video"), &prompt("waves"), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NotReady {
                state: SessionState::Connecting
            }
        ));
        assert_eq!(session.calls().len(), 1);
    }

    #[test]
    fn unusable_response_is_distinct_from_failure() {
        let session = ScriptedSession::new(vec![Ok(json!({"data": []}))]);
        let err = Dispatcher::new()
            .run_with_seed(&session, &registry_effect("text-to-video"), &prompt("waves"), 1)
            .unwrap_err();
        assert_eq!(err.to_string(), "No usable result returned by the model.");
        assert_eq!(session.calls().len(), 1);
    }

    #[test]
    fn remove_background_tries_its_dedicated_endpoint_first() {
        let session = ScriptedSession::new(vec![Ok(json!({"data": [{"path": "/tmp/x.png", "url": "https://h/file=/tmp/x.png"}]}))]);
        let result = Dispatcher::new()
            .run(&session, &registry_effect("remove-bg"), &with_file("", "/tmp/in.png"))
            .unwrap();
        assert_eq!(result.endpoint, EndpointRef::named("/process_image"));
        assert_eq!(result.seed, None);
        assert_eq!(result.display_text(), "https://h/file=/tmp/x.png");
    }
}
