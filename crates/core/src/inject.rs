//! Template placeholder substitution and typed parameter overrides.
//!
//! Before a workflow is submitted, [`Injector::inject`] walks every node
//! once and:
//!
//! 1. replaces `{{prompt}}` / `{{reference_image}}` tokens in every
//!    string reachable from the node's inputs, and
//! 2. applies each [`OverrideRule`] whose class/title pattern matches the
//!    node (frame count, frame rate, sampler settings, sampling shift,
//!    latent size).
//!
//! Overrides are absolute assignments, so re-running injection with the
//! same parameters leaves the graph unchanged. Rules that match nothing
//! are silent: a workflow need not contain every node type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::graph::{WorkflowGraph, WorkflowNode};
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Token replaced by the free-text prompt.
pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";

/// Token replaced by the uploaded reference media handle.
pub const REFERENCE_PLACEHOLDER: &str = "{{reference_image}}";

/// Spatial alignment required by video latent nodes (the sampler's
/// downsampling factor).
pub const LATENT_GRID: u32 = 64;

/// Smallest width/height a snapped latent node will receive.
pub const MIN_LATENT_DIMENSION: u32 = 256;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Optional numeric overrides. `None` leaves matching inputs untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_count: Option<u32>,
    pub frame_rate: Option<f64>,
    pub sampler_steps: Option<u32>,
    pub sampler_cfg: Option<f64>,
    pub sampling_shift: Option<f64>,
}

impl NumericOverrides {
    /// True when no override is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn validate(&self) -> Result<(), CoreError> {
        let floats = [
            ("frame_rate", self.frame_rate),
            ("sampler_cfg", self.sampler_cfg),
            ("sampling_shift", self.sampling_shift),
        ];
        for (name, value) in floats {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(CoreError::Validation(format!(
                        "{name} must be a finite number (got {v})"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Everything the injector needs for one job.
#[derive(Debug, Clone)]
pub struct InjectionParams {
    prompt: String,
    reference: Option<String>,
    overrides: NumericOverrides,
}

impl InjectionParams {
    /// Build a validated parameter set. The prompt must not be blank and
    /// floating-point overrides must be finite.
    pub fn new(
        prompt: impl Into<String>,
        reference: Option<String>,
        overrides: NumericOverrides,
    ) -> Result<Self, CoreError> {
        let prompt = prompt.into();
        validate_prompt(&prompt)?;
        overrides.validate()?;
        Ok(Self {
            prompt,
            reference,
            overrides,
        })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Backend handle of the uploaded reference media, if any.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn overrides(&self) -> &NumericOverrides {
        &self.overrides
    }
}

/// Validate a prompt: must contain something other than whitespace.
pub fn validate_prompt(text: &str) -> Result<(), CoreError> {
    if text.trim().is_empty() {
        return Err(CoreError::Validation(
            "Prompt must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

/// How a rule's class pattern is compared with a node's `class_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMatch {
    /// `class_type` must equal the pattern.
    Exact(&'static str),
    /// `class_type` must contain the pattern.
    Contains(&'static str),
}

impl ClassMatch {
    pub fn matches(&self, class_type: &str) -> bool {
        match self {
            ClassMatch::Exact(pattern) => class_type == *pattern,
            ClassMatch::Contains(pattern) => class_type.contains(pattern),
        }
    }
}

/// What a rule did to one node.
#[derive(Debug, Default)]
pub struct RuleEffect {
    /// Input names that were assigned.
    pub changed: Vec<&'static str>,
    /// Overrides that could not be applied.
    pub warnings: Vec<String>,
}

/// Mutation applied to a node that matched a rule.
pub type ApplyFn = fn(&mut WorkflowNode, &NumericOverrides) -> RuleEffect;

/// One typed override: which nodes it targets and how it rewrites them.
#[derive(Clone, Copy)]
pub struct OverrideRule {
    pub name: &'static str,
    pub class_match: ClassMatch,
    /// Case-insensitive substrings of `_meta.title`, any of which must
    /// match. Empty means the title is not consulted.
    pub title_keywords: &'static [&'static str],
    pub apply: ApplyFn,
}

impl OverrideRule {
    /// Whether this rule targets the given node.
    pub fn matches(&self, node: &WorkflowNode) -> bool {
        if !self.class_match.matches(node.class_type()) {
            return false;
        }
        if self.title_keywords.is_empty() {
            return true;
        }
        let Some(title) = node.title() else {
            return false;
        };
        let title = title.to_lowercase();
        self.title_keywords.iter().any(|kw| title.contains(kw))
    }
}

impl fmt::Debug for OverrideRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideRule")
            .field("name", &self.name)
            .field("class_match", &self.class_match)
            .field("title_keywords", &self.title_keywords)
            .finish()
    }
}

const FRAME_COUNT_TITLES: &[&str] = &["frame count", "frames", "length"];
const FRAME_RATE_TITLES: &[&str] = &["fps", "frame rate", "framerate"];

/// The built-in rule table.
///
/// | Rule                | Class match                 | Title keywords        |
/// |---------------------|-----------------------------|-----------------------|
/// | `frame_count`       | `PrimitiveInt`              | frame count / frames / length |
/// | `frame_rate_int`    | `PrimitiveInt`              | fps / frame rate      |
/// | `frame_rate_float`  | `PrimitiveFloat`            | fps / frame rate      |
/// | `sampler`           | contains `KSampler`         |                       |
/// | `sampling_shift`    | contains `ModelSampling`    |                       |
/// | `latent_size`       | `EmptyLatentImage`          |                       |
/// | `sd3_latent_size`   | `EmptySD3LatentImage`       |                       |
/// | `video_latent_size` | `EmptyHunyuanLatentVideo`   | (snapped to 64)       |
pub fn default_rules() -> Vec<OverrideRule> {
    vec![
        OverrideRule {
            name: "frame_count",
            class_match: ClassMatch::Exact("PrimitiveInt"),
            title_keywords: FRAME_COUNT_TITLES,
            apply: apply_frame_count,
        },
        OverrideRule {
            name: "frame_rate_int",
            class_match: ClassMatch::Exact("PrimitiveInt"),
            title_keywords: FRAME_RATE_TITLES,
            apply: apply_frame_rate_int,
        },
        OverrideRule {
            name: "frame_rate_float",
            class_match: ClassMatch::Exact("PrimitiveFloat"),
            title_keywords: FRAME_RATE_TITLES,
            apply: apply_frame_rate_float,
        },
        OverrideRule {
            name: "sampler",
            class_match: ClassMatch::Contains("KSampler"),
            title_keywords: &[],
            apply: apply_sampler,
        },
        OverrideRule {
            name: "sampling_shift",
            class_match: ClassMatch::Contains("ModelSampling"),
            title_keywords: &[],
            apply: apply_sampling_shift,
        },
        OverrideRule {
            name: "latent_size",
            class_match: ClassMatch::Exact("EmptyLatentImage"),
            title_keywords: &[],
            apply: apply_size,
        },
        OverrideRule {
            name: "sd3_latent_size",
            class_match: ClassMatch::Exact("EmptySD3LatentImage"),
            title_keywords: &[],
            apply: apply_size,
        },
        OverrideRule {
            name: "video_latent_size",
            class_match: ClassMatch::Exact("EmptyHunyuanLatentVideo"),
            title_keywords: &[],
            apply: apply_snapped_size,
        },
    ]
}

/// Round a dimension down to the latent grid, never below
/// [`MIN_LATENT_DIMENSION`].
pub fn snap_to_latent_grid(x: u32) -> u32 {
    (x / LATENT_GRID * LATENT_GRID).max(MIN_LATENT_DIMENSION)
}

// ---- rule bodies ----

fn assign(node: &mut WorkflowNode, effect: &mut RuleEffect, input: &'static str, value: Value) {
    node.set_input(input, value);
    effect.changed.push(input);
}

fn apply_frame_count(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(frames) = o.frame_count {
        assign(node, &mut effect, "value", json!(frames));
    }
    effect
}

fn apply_frame_rate_int(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(fps) = o.frame_rate {
        assign(node, &mut effect, "value", json!(fps.round() as i64));
    }
    effect
}

fn apply_frame_rate_float(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(fps) = o.frame_rate {
        assign(node, &mut effect, "value", json!(fps));
    }
    effect
}

fn apply_sampler(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(cfg) = o.sampler_cfg {
        if node.has_input("cfg") {
            assign(node, &mut effect, "cfg", json!(cfg));
        } else {
            effect.warnings.push(format!(
                "{} node has no 'cfg' input; cfg override skipped",
                node.class_type()
            ));
        }
    }
    if let Some(steps) = o.sampler_steps {
        if node.has_input("steps") {
            assign(node, &mut effect, "steps", json!(steps));
        } else {
            effect.warnings.push(format!(
                "{} node has no 'steps' input; steps override skipped",
                node.class_type()
            ));
        }
    }
    effect
}

fn apply_sampling_shift(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(shift) = o.sampling_shift {
        assign(node, &mut effect, "shift", json!(shift));
    }
    effect
}

fn apply_size(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(width) = o.width {
        assign(node, &mut effect, "width", json!(width));
    }
    if let Some(height) = o.height {
        assign(node, &mut effect, "height", json!(height));
    }
    effect
}

fn apply_snapped_size(node: &mut WorkflowNode, o: &NumericOverrides) -> RuleEffect {
    let mut effect = RuleEffect::default();
    if let Some(width) = o.width {
        assign(node, &mut effect, "width", json!(snap_to_latent_grid(width)));
    }
    if let Some(height) = o.height {
        assign(node, &mut effect, "height", json!(snap_to_latent_grid(height)));
    }
    effect
}

// ---------------------------------------------------------------------------
// Injector
// ---------------------------------------------------------------------------

/// A single input assignment made by an override rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedOverride {
    pub node_id: NodeId,
    pub rule: &'static str,
    pub input: &'static str,
}

/// Summary of one injection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InjectionReport {
    pub prompt_replacements: usize,
    pub reference_replacements: usize,
    pub overrides: Vec<AppliedOverride>,
    pub warnings: Vec<String>,
}

/// Applies placeholder substitution and an override rule table to a graph.
#[derive(Debug, Clone)]
pub struct Injector {
    rules: Vec<OverrideRule>,
}

impl Default for Injector {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Injector {
    /// Create an injector with a custom rule table.
    pub fn new(rules: Vec<OverrideRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[OverrideRule] {
        &self.rules
    }

    /// Mutate `graph` in place. Never fails; see [`InjectionReport`] for
    /// what was changed and which overrides were skipped.
    pub fn inject(&self, graph: &mut WorkflowGraph, params: &InjectionParams) -> InjectionReport {
        let mut report = InjectionReport::default();

        let mut tokens: Vec<(&str, &str)> = vec![(PROMPT_PLACEHOLDER, params.prompt())];
        if let Some(reference) = params.reference() {
            tokens.push((REFERENCE_PLACEHOLDER, reference));
        }

        for (node_id, node) in graph.nodes_mut() {
            node.visit_input_strings_mut(&mut |text| {
                if let Some((replaced, counts)) = substitute(text, &tokens) {
                    *text = replaced;
                    report.prompt_replacements += counts[0];
                    report.reference_replacements += counts.get(1).copied().unwrap_or(0);
                }
            });

            let matched: Vec<&OverrideRule> = self.rules.iter().filter(|r| r.matches(node)).collect();
            for rule in matched {
                let effect = (rule.apply)(node, params.overrides());
                for input in effect.changed {
                    tracing::debug!(node_id = %node_id, rule = rule.name, input, "Override applied");
                    report.overrides.push(AppliedOverride {
                        node_id: node_id.clone(),
                        rule: rule.name,
                        input,
                    });
                }
                for warning in effect.warnings {
                    tracing::warn!(node_id = %node_id, rule = rule.name, "{warning}");
                    report.warnings.push(format!("node {node_id}: {warning}"));
                }
            }
        }

        report
    }
}

/// Inject with the built-in rule table and return the graph for chaining.
pub fn inject<'g>(graph: &'g mut WorkflowGraph, params: &InjectionParams) -> &'g mut WorkflowGraph {
    let report = Injector::default().inject(graph, params);
    tracing::debug!(
        prompt_replacements = report.prompt_replacements,
        reference_replacements = report.reference_replacements,
        overrides = report.overrides.len(),
        "Workflow injected",
    );
    graph
}

/// Replace every token occurrence in a single left-to-right scan.
///
/// Replacement text is emitted as-is and never rescanned. Returns `None`
/// when no token occurs, otherwise the new string plus per-token counts
/// (parallel to `tokens`).
fn substitute(text: &str, tokens: &[(&str, &str)]) -> Option<(String, Vec<usize>)> {
    if !tokens.iter().any(|(token, _)| text.contains(token)) {
        return None;
    }

    let mut out = String::with_capacity(text.len());
    let mut counts = vec![0; tokens.len()];
    let mut rest = text;

    'scan: while !rest.is_empty() {
        for (i, (token, replacement)) in tokens.iter().enumerate() {
            if let Some(after) = rest.strip_prefix(token) {
                out.push_str(replacement);
                counts[i] += 1;
                rest = after;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }

    Some((out, counts))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
