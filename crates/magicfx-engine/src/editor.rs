use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use magicfx_contracts::effects::{
    append_style, style_preset, EffectDescriptor, EffectRegistry, InputKind, StylePreset,
};
use magicfx_contracts::events::{EventSink, EventWriter};
use magicfx_contracts::runs::history::{HistoryEntry, HistoryStore};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::dispatch::{
    argument_shape, DispatchError, Dispatcher, GenerationInput, GenerationResult, InputError,
};
use crate::session::{SessionManager, SessionSnapshot, SessionState, StatusSchedule};
use crate::transport::RemoteTransport;

/// Why the run action is currently unavailable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunBlocker {
    #[error("Select an effect first.")]
    NoEffect,
    #[error("Client not ready (session is {state})")]
    SessionNotReady { state: SessionState },
    #[error("{effect} needs an input file")]
    MissingFile { effect: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Blocked(#[from] RunBlocker),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// One mounted effect editor: the selected effect, its single remote
/// session, the accumulated input and the outcome of the last run.
pub struct EditorView {
    registry: EffectRegistry,
    session: SessionManager,
    dispatcher: Dispatcher,
    events: EventSink,
    history: Option<HistoryStore>,
    effect: Option<EffectDescriptor>,
    input: GenerationInput,
    result: Option<GenerationResult>,
    error: Option<String>,
}

impl EditorView {
    pub fn new(transport: Arc<dyn RemoteTransport>, schedule: StatusSchedule) -> Self {
        Self {
            registry: EffectRegistry::default(),
            session: SessionManager::new(transport, schedule),
            dispatcher: Dispatcher::new(),
            events: EventSink::disabled(),
            history: None,
            effect: None,
            input: GenerationInput::default(),
            result: None,
            error: None,
        }
    }

    pub fn with_registry(mut self, registry: EffectRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        let events = EventSink::from(events);
        self.session.set_events(events.clone());
        self.dispatcher = Dispatcher::new().with_events(events.clone());
        self.events = events;
        self
    }

    pub fn with_history(mut self, history: Option<HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn registry(&self) -> &EffectRegistry {
        &self.registry
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn effect(&self) -> Option<&EffectDescriptor> {
        self.effect.as_ref()
    }

    pub fn input(&self) -> &GenerationInput {
        &self.input
    }

    pub fn prompt(&self) -> &str {
        &self.input.prompt
    }

    pub fn result(&self) -> Option<&GenerationResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Switches to `effect_id`: the previous session is torn down, input and
    /// outcome are cleared and a new session opens for the effect's model.
    pub fn select(&mut self, effect_id: &str) -> Result<&EffectDescriptor> {
        let Some(effect) = self.registry.get(effect_id.trim()).cloned() else {
            bail!("unknown effect '{}'", effect_id.trim());
        };
        self.reset();
        self.input.prompt = effect.default_prompt.clone().unwrap_or_default();
        info!("selected {} ({})", effect.id, effect.model_id);
        self.session.open(&effect.model_id);
        Ok(&*self.effect.insert(effect))
    }

    /// Leaves the current effect and closes its session.
    pub fn back(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.session.close();
        self.effect = None;
        self.input = GenerationInput::default();
        self.result = None;
        self.error = None;
    }

    pub fn set_prompt(&mut self, prompt: &str) {
        self.input.prompt = prompt.to_string();
    }

    pub fn apply_style(&mut self, name: &str) -> Result<&'static StylePreset> {
        let Some(preset) = style_preset(name) else {
            bail!("unknown style '{}'", name.trim());
        };
        self.input.prompt = append_style(&self.input.prompt, preset.prompt);
        Ok(preset)
    }

    pub fn attach_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let Some(effect) = self.effect.as_ref() else {
            bail!(RunBlocker::NoEffect);
        };
        if !effect.input_kind.takes_file() {
            bail!(InputError::FileNotAccepted {
                effect: effect.name.clone(),
            });
        }
        if !path.is_file() {
            bail!(InputError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        if effect.input_kind == InputKind::Image {
            let (width, height) =
                image::image_dimensions(path).map_err(|err| InputError::UnreadableImage {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
            debug!("attached {}x{} image {}", width, height, path.display());
        }
        self.input.file = Some(path.to_path_buf());
        Ok(())
    }

    pub fn run_gate(&self) -> Option<RunBlocker> {
        let Some(effect) = self.effect.as_ref() else {
            return Some(RunBlocker::NoEffect);
        };
        let state = self.session.state();
        if state != SessionState::Ready {
            return Some(RunBlocker::SessionNotReady { state });
        }
        if argument_shape(effect).takes_file() && self.input.file.is_none() {
            return Some(RunBlocker::MissingFile {
                effect: effect.name.clone(),
            });
        }
        None
    }

    /// Runs the selected effect. The outcome is kept as the view's result or error.
    pub fn run(&mut self) -> Result<&GenerationResult, RunError> {
        if let Some(blocker) = self.run_gate() {
            self.error = Some(blocker.to_string());
            return Err(blocker.into());
        }
        let Some(effect) = self.effect.clone() else {
            return Err(RunBlocker::NoEffect.into());
        };

        self.result = None;
        self.error = None;
        self.events.emit(
            "generation_started",
            json!({
                "effect_id": effect.id,
                "model_id": effect.model_id,
                "prompt": self.input.effective_prompt(&effect),
                "file": self.input.file.as_ref().map(|path| path.to_string_lossy()),
            }),
        );

        match self.dispatcher.run(&self.session, &effect, &self.input) {
            Ok(result) => {
                self.events.emit(
                    "generation_finished",
                    json!({
                        "effect_id": result.effect_id,
                        "endpoint": result.endpoint.to_string(),
                        "seed": result.seed,
                        "result": result.media,
                    }),
                );
                self.record_history(&effect, &result);
                Ok(&*self.result.insert(result))
            }
            Err(err) => {
                self.error = Some(err.to_string());
                let attempts: Vec<Value> = err
                    .attempts()
                    .iter()
                    .map(|attempt| {
                        json!({ "endpoint": attempt.endpoint.to_string(), "error": attempt.error })
                    })
                    .collect();
                self.events.emit(
                    "generation_failed",
                    json!({
                        "effect_id": effect.id,
                        "error": err.to_string(),
                        "attempts": attempts,
                    }),
                );
                Err(err.into())
            }
        }
    }

    fn record_history(&self, effect: &EffectDescriptor, result: &GenerationResult) {
        let Some(history) = self.history.as_ref() else {
            return;
        };
        let mut entry = HistoryEntry::new(
            &effect.id,
            &effect.model_id,
            &result.endpoint.to_string(),
            result.media.clone(),
        );
        entry.seed = result.seed;
        entry.prompt = Some(self.input.effective_prompt(effect)).filter(|text| !text.is_empty());
        if let Some(file) = self.input.file.as_ref() {
            entry.input_file = Some(file.to_string_lossy().to_string());
            entry.input_sha256 = match file_sha256(file) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!("skipping input hash: {err:#}");
                    None
                }
            };
        }
        if let Err(err) = history.append(&entry) {
            warn!("failed appending history to {}: {err:#}", history.path().display());
        }
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// Default location for `--save` when the caller names a directory.
pub fn default_save_name(result: &GenerationResult) -> PathBuf {
    let url = result.media_url().unwrap_or_default();
    let tail = url
        .rsplit(['/', '='])
        .next()
        .filter(|name| name.contains('.'))
        .map(str::to_string);
    PathBuf::from(tail.unwrap_or_else(|| format!("{}.bin", result.effect_id)))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use indexmap::IndexMap;
    use magicfx_contracts::effects::{EffectDescriptor, EffectRegistry, EndpointRef, InputKind};
    use magicfx_contracts::events::EventWriter;
    use magicfx_contracts::runs::history::HistoryStore;
    use serde_json::{json, Value};

    use super::{default_save_name, EditorView, RunBlocker, RunError};
    use crate::dispatch::{DispatchError, GenerationResult};
    use crate::session::tests::GatedTransport;
    use crate::session::{SessionState, StatusSchedule};
    use crate::transport::DryrunTransport;

    fn dryrun_editor() -> EditorView {
        EditorView::new(Arc::new(DryrunTransport::new()), StatusSchedule::silent())
    }

    fn wait_ready(editor: &EditorView) -> SessionState {
        editor
            .session()
            .wait_resolved(Duration::from_secs(5))
            .state
    }

    fn write_png(path: &std::path::Path) -> anyhow::Result<()> {
        image::RgbImage::new(4, 3).save(path)?;
        Ok(())
    }

    #[test]
    fn select_opens_a_session_and_prefills_default_prompt() -> anyhow::Result<()> {
        let mut editor = dryrun_editor();
        assert!(editor.select("nope").is_err());

        editor.select("bullet-time")?;
        assert_eq!(
            editor.prompt(),
            "bullet time, matrix style, 360 orbit, frozen action"
        );
        assert_eq!(
            editor.snapshot().target.as_deref(),
            Some("cerspense/zeroscope_v2_576w")
        );

        editor.select("text-to-image")?;
        assert_eq!(editor.prompt(), "");
        assert_eq!(
            editor.snapshot().target.as_deref(),
            Some("black-forest-labs/FLUX.1-schnell")
        );
        Ok(())
    }

    #[test]
    fn styles_append_to_the_prompt() -> anyhow::Result<()> {
        let mut editor = dryrun_editor();
        editor.select("text-to-image")?;
        editor.apply_style("cinematic")?;
        assert_eq!(
            editor.prompt(),
            "cinematic lighting, 8k, highly detailed, realistic"
        );
        editor.set_prompt("a harbor at dawn");
        editor.apply_style("Vintage")?;
        assert_eq!(
            editor.prompt(),
            "a harbor at dawn, vintage 90s camcorder style, vhs glitch, retro"
        );
        assert!(editor.apply_style("watercolor").is_err());
        Ok(())
    }

    #[test]
    fn attach_file_checks_kind_existence_and_image_format() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let png = temp.path().join("still.png");
        write_png(&png)?;
        let junk = temp.path().join("junk.png");
        fs::write(&junk, b"not an image")?;

        let mut editor = dryrun_editor();
        assert!(editor.attach_file(&png).is_err());

        editor.select("text-to-video")?;
        let err = editor.attach_file(&png).unwrap_err();
        assert!(err.to_string().contains("takes a text prompt"));

        editor.select("upscale")?;
        assert!(editor.attach_file(temp.path().join("missing.png")).is_err());
        let err = editor.attach_file(&junk).unwrap_err();
        assert!(err.to_string().contains("not a readable image"));
        editor.attach_file(&png)?;
        assert_eq!(editor.input().file.as_deref(), Some(png.as_path()));

        editor.select("slow-motion")?;
        assert_eq!(editor.input().file, None);
        let clip = temp.path().join("clip.mp4");
        fs::write(&clip, b"\x00\x00\x00\x18ftypmp42")?;
        editor.attach_file(&clip)?;
        Ok(())
    }

    #[test]
    fn run_gate_reports_missing_effect_session_and_file() -> anyhow::Result<()> {
        let transport = Arc::new(GatedTransport::default());
        let mut editor = EditorView::new(transport.clone(), StatusSchedule::silent());
        assert_eq!(editor.run_gate(), Some(RunBlocker::NoEffect));

        editor.select("remove-bg")?;
        assert_eq!(
            editor.run_gate(),
            Some(RunBlocker::SessionNotReady {
                state: SessionState::Connecting
            })
        );
        assert!(matches!(
            editor.run(),
            Err(RunError::Blocked(RunBlocker::SessionNotReady { .. }))
        ));
        assert!(editor.error().is_some());

        transport.release();
        assert_eq!(wait_ready(&editor), SessionState::Ready);
        assert_eq!(
            editor.run_gate(),
            Some(RunBlocker::MissingFile {
                effect: "Remove Background".to_string()
            })
        );
        Ok(())
    }

    #[test]
    fn failed_session_gates_run() -> anyhow::Result<()> {
        let mut effects = IndexMap::new();
        effects.insert(
            "offline".to_string(),
            EffectDescriptor {
                id: "offline".to_string(),
                name: "Offline".to_string(),
                description: String::new(),
                category: "Generation".to_string(),
                model_id: "fail/offline".to_string(),
                input_kind: InputKind::Text,
                requires_prompt: false,
                default_prompt: None,
                icon: "Film".to_string(),
                endpoints: vec![EndpointRef::Index(0)],
            },
        );
        let mut editor = dryrun_editor().with_registry(EffectRegistry::new(Some(effects)));
        editor.select("offline")?;
        assert_eq!(wait_ready(&editor), SessionState::Failed);
        assert_eq!(
            editor.run_gate(),
            Some(RunBlocker::SessionNotReady {
                state: SessionState::Failed
            })
        );
        Ok(())
    }

    #[test]
    fn run_records_result_history_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let history = HistoryStore::new(temp.path().join("history.jsonl"));
        let mut editor = dryrun_editor()
            .with_events(EventWriter::new(&events_path, "studio"))
            .with_history(Some(history.clone()));

        editor.select("text-to-image")?;
        editor.set_prompt("a glass teapot");
        assert_eq!(wait_ready(&editor), SessionState::Ready);
        let result = editor.run()?.clone();
        assert_eq!(result.endpoint, EndpointRef::named("/infer"));
        assert!(result
            .display_text()
            .starts_with("dryrun://black-forest-labs/FLUX.1-schnell/infer/"));
        assert_eq!(editor.result(), Some(&result));
        assert_eq!(editor.error(), None);

        let entries = history.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].effect_id, "text-to-image");
        assert_eq!(entries[0].prompt.as_deref(), Some("a glass teapot"));
        assert_eq!(entries[0].seed, result.seed);

        let types: Vec<String> = fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert!(types.contains(&"session_ready".to_string()));
        assert!(types.ends_with(&[
            "generation_started".to_string(),
            "generation_finished".to_string()
        ]));

        editor.back();
        assert!(editor.effect().is_none());
        assert!(editor.result().is_none());
        Ok(())
    }

    #[test]
    fn file_runs_hash_their_input() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let png = temp.path().join("portrait.png");
        write_png(&png)?;
        let history = HistoryStore::new(temp.path().join("history.jsonl"));
        let mut editor = dryrun_editor().with_history(Some(history.clone()));

        editor.select("remove-bg")?;
        editor.attach_file(&png)?;
        assert_eq!(wait_ready(&editor), SessionState::Ready);
        let result = editor.run()?;
        assert_eq!(result.endpoint, EndpointRef::named("/process_image"));
        assert_eq!(result.seed, None);

        let entry = history.recent(1).remove(0);
        assert_eq!(entry.input_sha256.map(|digest| digest.len()), Some(64));
        assert_eq!(entry.prompt, None);
        Ok(())
    }

    #[test]
    fn run_without_prompt_surfaces_input_error() -> anyhow::Result<()> {
        let mut editor = dryrun_editor();
        editor.select("text-to-video")?;
        assert_eq!(wait_ready(&editor), SessionState::Ready);
        let err = editor.run().unwrap_err();
        assert!(matches!(err, RunError::Dispatch(DispatchError::Input(_))));
        assert_eq!(editor.error(), Some("Text to Video needs a prompt"));
        Ok(())
    }

    #[test]
    fn save_name_comes_from_the_url_tail() {
        let result = |media: Value| GenerationResult {
            effect_id: "upscale".to_string(),
            endpoint: EndpointRef::Index(0),
            seed: None,
            media,
        };
        assert_eq!(
            default_save_name(&result(json!("https://h/file=/tmp/gradio/abc/out.webp"))),
            std::path::PathBuf::from("out.webp")
        );
        assert_eq!(
            default_save_name(&result(json!({}))),
            std::path::PathBuf::from("upscale.bin")
        );
    }
}
