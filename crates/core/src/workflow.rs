//! ComfyUI job graph template.
//!
//! A [`JobGraphTemplate`] is a fixed DAG of named stages (ComfyUI
//! "nodes" in API format). Three stage inputs are external: the prompt
//! text, the noise seed and the output filename prefix. Everything else
//! is a constant. [`JobGraphTemplate::instantiate`] binds the three
//! inputs and produces the JSON body ComfyUI expects under `"prompt"`.
//!
//! Templates are either the built-in Flux + LoRA graph
//! ([`JobGraphTemplate::flux_pixar`]) or loaded from a JSON file.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::types::Seed;

// ---------------------------------------------------------------------------
// ComfyUI class types used for slot discovery
// ---------------------------------------------------------------------------

const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
const RANDOM_NOISE_CLASS: &str = "RandomNoise";
const KSAMPLER_CLASS: &str = "KSampler";
const SAVE_IMAGE_CLASS: &str = "SaveImage";

// ---------------------------------------------------------------------------
// Built-in template constants
// ---------------------------------------------------------------------------

const FLUX_UNET: &str = "flux1-dev.safetensors";
const FLUX_T5_CLIP: &str = "flux/t5xxl_fp16.safetensors";
const FLUX_L_CLIP: &str = "flux/clip_l.safetensors";
const FLUX_VAE: &str = "flux/ae.safetensors";
const PIXAR_LORA: &str = "flux/PixarPerfect_3D_Animation_Style_FLUX-000001.safetensors";
const IMAGE_SIZE: u32 = 512;
const SAMPLER_STEPS: u32 = 30;
const FLUX_GUIDANCE: f64 = 3.5;

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Value of a single stage input.
///
/// ComfyUI encodes a reference to another stage's output as a two-element
/// array `["<stage id>", <output index>]`; anything else is a literal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    Link(String, u32),
    Literal(Value),
}

impl Binding {
    pub fn link(stage: &str, output: u32) -> Self {
        Binding::Link(stage.to_string(), output)
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Binding::Literal(value.into())
    }

    fn to_value(&self) -> Value {
        match self {
            Binding::Link(stage, output) => json!([stage, output]),
            Binding::Literal(v) => v.clone(),
        }
    }
}

/// One stage of the graph.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Stage {
    /// ComfyUI node class, e.g. `"KSamplerSelect"`.
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Binding>,
}

impl Stage {
    fn of(class_type: &str) -> Self {
        Self {
            class_type: class_type.to_string(),
            inputs: BTreeMap::new(),
        }
    }

    fn with_inputs<const N: usize>(mut self, inputs: [(&str, Binding); N]) -> Self {
        self.inputs.extend(
            inputs
                .into_iter()
                .map(|(name, binding)| (name.to_string(), binding)),
        );
        self
    }
}

/// Address of one stage input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputSlot {
    pub stage: String,
    pub input: String,
}

impl InputSlot {
    pub fn new(stage: &str, input: &str) -> Self {
        Self {
            stage: stage.to_string(),
            input: input.to_string(),
        }
    }
}

/// A validated job graph with its three external inputs designated.
#[derive(Debug, Clone, PartialEq)]
pub struct JobGraphTemplate {
    stages: BTreeMap<String, Stage>,
    prompt_slot: InputSlot,
    seed_slot: InputSlot,
    prefix_slot: InputSlot,
    output_stage: String,
}

/// On-disk template format. Slots that are omitted are discovered from
/// the node classes in the graph.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    stages: BTreeMap<String, Stage>,
    #[serde(default)]
    prompt_slot: Option<InputSlot>,
    #[serde(default)]
    seed_slot: Option<InputSlot>,
    #[serde(default)]
    prefix_slot: Option<InputSlot>,
    #[serde(default)]
    output_stage: Option<String>,
}

impl JobGraphTemplate {
    /// Build a template from parts, validating its structure.
    pub fn new(
        stages: BTreeMap<String, Stage>,
        prompt_slot: InputSlot,
        seed_slot: InputSlot,
        prefix_slot: InputSlot,
        output_stage: String,
    ) -> Result<Self, CoreError> {
        let template = Self {
            stages,
            prompt_slot,
            seed_slot,
            prefix_slot,
            output_stage,
        };
        template.validate()?;
        Ok(template)
    }

    /// Flux dev with the PixarPerfect LoRA at 512x512, 30 euler steps.
    pub fn flux_pixar() -> Self {
        let unet = Stage::of("UNETLoader").with_inputs([
            ("unet_name", Binding::literal(FLUX_UNET)),
            ("weight_dtype", Binding::literal("default")),
        ]);
        let clip = Stage::of("DualCLIPLoader").with_inputs([
            ("clip_name1", Binding::literal(FLUX_T5_CLIP)),
            ("clip_name2", Binding::literal(FLUX_L_CLIP)),
            ("type", Binding::literal("flux")),
        ]);
        let vae = Stage::of("VAELoader").with_inputs([("vae_name", Binding::literal(FLUX_VAE))]);
        let model_sampling = Stage::of("ModelSamplingFlux").with_inputs([
            ("model", Binding::link("12", 0)),
            ("max_shift", Binding::literal(1.15)),
            ("base_shift", Binding::literal(0.5)),
            ("width", Binding::literal(IMAGE_SIZE)),
            ("height", Binding::literal(IMAGE_SIZE)),
        ]);
        let lora = Stage::of("LoraLoader").with_inputs([
            ("model", Binding::link("30", 0)),
            ("clip", Binding::link("11", 0)),
            ("lora_name", Binding::literal(PIXAR_LORA)),
            ("strength_model", Binding::literal(1.0)),
            ("strength_clip", Binding::literal(1.0)),
        ]);
        let prompt = Stage::of(CLIP_TEXT_ENCODE_CLASS).with_inputs([
            ("clip", Binding::link("47", 1)),
            ("text", Binding::literal("")),
        ]);
        let guidance = Stage::of("FluxGuidance").with_inputs([
            ("conditioning", Binding::link("6", 0)),
            ("guidance", Binding::literal(FLUX_GUIDANCE)),
        ]);
        let noise =
            Stage::of(RANDOM_NOISE_CLASS).with_inputs([("noise_seed", Binding::literal(0))]);
        let latent = Stage::of("EmptySD3LatentImage").with_inputs([
            ("width", Binding::literal(IMAGE_SIZE)),
            ("height", Binding::literal(IMAGE_SIZE)),
            ("batch_size", Binding::literal(1)),
        ]);
        let sampler =
            Stage::of("KSamplerSelect").with_inputs([("sampler_name", Binding::literal("euler"))]);
        let scheduler = Stage::of("BasicScheduler").with_inputs([
            ("model", Binding::link("30", 0)),
            ("scheduler", Binding::literal("beta")),
            ("steps", Binding::literal(SAMPLER_STEPS)),
            ("denoise", Binding::literal(1.0)),
        ]);
        let guider = Stage::of("BasicGuider").with_inputs([
            ("model", Binding::link("47", 0)),
            ("conditioning", Binding::link("26", 0)),
        ]);
        let sample = Stage::of("SamplerCustomAdvanced").with_inputs([
            ("noise", Binding::link("25", 0)),
            ("guider", Binding::link("22", 0)),
            ("sampler", Binding::link("16", 0)),
            ("sigmas", Binding::link("17", 0)),
            ("latent_image", Binding::link("27", 0)),
        ]);
        let decode = Stage::of("VAEDecode").with_inputs([
            ("samples", Binding::link("13", 0)),
            ("vae", Binding::link("10", 0)),
        ]);
        let save = Stage::of(SAVE_IMAGE_CLASS).with_inputs([
            ("images", Binding::link("8", 0)),
            ("filename_prefix", Binding::literal("avatar")),
        ]);

        let stages: BTreeMap<String, Stage> = [
            ("12", unet),
            ("11", clip),
            ("10", vae),
            ("30", model_sampling),
            ("47", lora),
            ("6", prompt),
            ("26", guidance),
            ("25", noise),
            ("27", latent),
            ("16", sampler),
            ("17", scheduler),
            ("22", guider),
            ("13", sample),
            ("8", decode),
            ("9", save),
        ]
        .into_iter()
        .map(|(id, stage)| (id.to_string(), stage))
        .collect();

        Self {
            stages,
            prompt_slot: InputSlot::new("6", "text"),
            seed_slot: InputSlot::new("25", "noise_seed"),
            prefix_slot: InputSlot::new("9", "filename_prefix"),
            output_stage: "9".to_string(),
        }
    }

    /// Load a template from a JSON file.
    ///
    /// The file holds `stages` in ComfyUI API format plus optional
    /// `prompt_slot`, `seed_slot`, `prefix_slot` and `output_stage`.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw, &path.display().to_string())
    }

    /// Parse a template from JSON text. See [`load`](Self::load).
    pub fn from_json_str(raw: &str, source_name: &str) -> Result<Self, CoreError> {
        let file: TemplateFile = serde_json::from_str(raw).map_err(|e| CoreError::Parse {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;

        let prompt_slot = match file.prompt_slot {
            Some(slot) => slot,
            None => discover_slot(&file.stages, &[(CLIP_TEXT_ENCODE_CLASS, "text")], "prompt")?,
        };
        let seed_slot = match file.seed_slot {
            Some(slot) => slot,
            None => discover_slot(
                &file.stages,
                &[(RANDOM_NOISE_CLASS, "noise_seed"), (KSAMPLER_CLASS, "seed")],
                "seed",
            )?,
        };
        let prefix_slot = match file.prefix_slot {
            Some(slot) => slot,
            None => {
                discover_slot(&file.stages, &[(SAVE_IMAGE_CLASS, "filename_prefix")], "prefix")?
            }
        };
        let output_stage = file.output_stage.unwrap_or_else(|| prefix_slot.stage.clone());

        Self::new(file.stages, prompt_slot, seed_slot, prefix_slot, output_stage)
    }

    /// Stage whose `images` output holds the generated artifact.
    pub fn output_stage(&self) -> &str {
        &self.output_stage
    }

    pub fn stages(&self) -> &BTreeMap<String, Stage> {
        &self.stages
    }

    /// Bind the external inputs and return the ComfyUI API-format graph.
    pub fn instantiate(&self, prompt_text: &str, seed: Seed, label_prefix: &str) -> Value {
        let overrides: [(&InputSlot, Value); 3] = [
            (&self.prompt_slot, json!(prompt_text)),
            (&self.seed_slot, json!(seed)),
            (&self.prefix_slot, json!(label_prefix)),
        ];

        let mut graph = serde_json::Map::with_capacity(self.stages.len());
        for (id, stage) in &self.stages {
            let mut inputs = serde_json::Map::with_capacity(stage.inputs.len());
            for (name, binding) in &stage.inputs {
                inputs.insert(name.clone(), binding.to_value());
            }
            for (slot, value) in &overrides {
                if slot.stage == *id {
                    inputs.insert(slot.input.clone(), value.clone());
                }
            }
            graph.insert(
                id.clone(),
                json!({ "class_type": stage.class_type, "inputs": inputs }),
            );
        }
        Value::Object(graph)
    }

    /// Structural checks: slots exist, links resolve, no cycles.
    fn validate(&self) -> Result<(), CoreError> {
        if self.stages.is_empty() {
            return Err(CoreError::Validation("Template has no stages".into()));
        }

        for (name, slot) in [
            ("prompt", &self.prompt_slot),
            ("seed", &self.seed_slot),
            ("prefix", &self.prefix_slot),
        ] {
            let stage = self.stages.get(&slot.stage).ok_or_else(|| {
                CoreError::Validation(format!(
                    "{name} slot references missing stage '{}'",
                    slot.stage
                ))
            })?;
            if !stage.inputs.contains_key(&slot.input) {
                return Err(CoreError::Validation(format!(
                    "{name} slot: stage '{}' has no input '{}'",
                    slot.stage, slot.input
                )));
            }
        }

        if !self.stages.contains_key(&self.output_stage) {
            return Err(CoreError::Validation(format!(
                "Output stage '{}' not found",
                self.output_stage
            )));
        }

        for (id, stage) in &self.stages {
            for (input, binding) in &stage.inputs {
                if let Binding::Link(target, _) = binding {
                    if !self.stages.contains_key(target) {
                        return Err(CoreError::Validation(format!(
                            "Stage '{id}' input '{input}' links to missing stage '{target}'"
                        )));
                    }
                }
            }
        }

        self.check_acyclic()
    }

    /// Depth-first search with three-colour marking.
    fn check_acyclic(&self) -> Result<(), CoreError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            id: &'a str,
            stages: &'a BTreeMap<String, Stage>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), CoreError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(CoreError::Validation(format!(
                        "Template graph has a cycle through stage '{id}'"
                    )))
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(stage) = stages.get(id) {
                for binding in stage.inputs.values() {
                    if let Binding::Link(target, _) = binding {
                        visit(target, stages, marks)?;
                    }
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for id in self.stages.keys() {
            visit(id, &self.stages, &mut marks)?;
        }
        Ok(())
    }
}

/// Find the single stage input matching one of `candidates`
/// (`(class_type, input)` pairs, in preference order).
fn discover_slot(
    stages: &BTreeMap<String, Stage>,
    candidates: &[(&str, &str)],
    slot_name: &str,
) -> Result<InputSlot, CoreError> {
    for (class_type, input) in candidates {
        let matches: Vec<&String> = stages
            .iter()
            .filter(|(_, s)| s.class_type == *class_type && s.inputs.contains_key(*input))
            .map(|(id, _)| id)
            .collect();
        match matches.as_slice() {
            [] => continue,
            [id] => return Ok(InputSlot::new(id, input)),
            _ => {
                let count = matches.len();
                return Err(CoreError::Validation(format!(
                    "Ambiguous {slot_name} slot: {count} {class_type} stages; set {slot_name}_slot"
                )));
            }
        }
    }
    Err(CoreError::Validation(format!(
        "No {slot_name} slot found; set {slot_name}_slot explicitly"
    )))
}
