//! Typed view over the engine's manifest store report.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const TRAINING_MINING_LABELS: [&str; 2] = ["cawg.training-mining", "c2pa.training-mining"];

const TRAINING_ENTRY_KEYS: [&str; 4] = [
    "cawg.ai_inference",
    "cawg.ai_generative_training",
    "c2pa.ai_inference",
    "c2pa.ai_generative_training",
];

const NOT_ALLOWED_USES: [&str; 2] = ["notAllowed", "constrained"];

const HUMAN_EDITS: &str = "http://cv.iptc.org/newscodes/digitalsourcetype/humanEdits";

const ACTION_LABELS: [&str; 2] = ["c2pa.actions", "c2pa.actions.v2"];

const LEGACY_GENERATIVE_LABEL: &str = "com.adobe.generative-ai";

const DIGITAL_SOURCE_TYPE_PREFIXES: [&str; 2] = [
    "http://cv.iptc.org/newscodes/digitalsourcetype/",
    "https://cv.iptc.org/newscodes/digitalsourcetype/",
];

// Pre-2.0 actions carry these as parameters instead of fields
const PARAM_DIGITAL_SOURCE_TYPE: &str = "com.adobe.digitalSourceType";
const PARAM_DETAILS: &str = "com.adobe.details";

// Old-style XMP agent strings carry a space-separated version
static XMP_AGENT_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\d+\.\d(\.\d)*\s+").expect("valid regex"));

/// A C2PA manifest store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestStore {
    /// Label of the active manifest.
    pub active_manifest: Option<String>,
    pub manifests: HashMap<String, Manifest>,
    pub validation_status: Vec<ValidationStatus>,
}

impl ManifestStore {
    /// Parse a report as returned by `getReport`.
    pub fn from_report(report: Value) -> Result<Self> {
        let store: ManifestStore = serde_json::from_value(report)
            .map_err(|e| Error::InvalidReport(format!("malformed manifest store: {e}")))?;

        if let Some(label) = &store.active_manifest {
            if !store.manifests.contains_key(label) {
                return Err(Error::InvalidReport(format!(
                    "active manifest {label} is not in the store"
                )));
            }
        }
        Ok(store)
    }

    /// The active manifest, if the store names one.
    pub fn active(&self) -> Option<&Manifest> {
        self.active_manifest
            .as_ref()
            .and_then(|label| self.manifests.get(label))
    }

    /// Whether every manifest in a non-empty store declares a purely
    /// human-edited history.
    pub fn is_handmade(&self) -> bool {
        !self.manifests.is_empty() && self.manifests.values().all(Manifest::is_handmade)
    }

    /// Whether validation reported any problems.
    pub fn has_validation_errors(&self) -> bool {
        !self.validation_status.is_empty()
    }

    /// Whether any manifest records generative AI involvement.
    pub fn has_generative_info(&self) -> bool {
        self.manifests
            .values()
            .any(|manifest| !manifest.generative_info().is_empty())
    }

    /// Copy the verified identities of a CAWG report onto the manifests it
    /// names. Labels the store does not contain are ignored.
    pub fn attach_cawg_report(&mut self, report: &CawgReport) {
        for (label, reports) in report {
            if let Some(manifest) = self.manifests.get_mut(label) {
                manifest.verified_identities = verified_identities(reports);
            }
        }
    }
}

/// One validation problem reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationStatus {
    pub code: String,
    pub url: Option<String>,
    pub explanation: Option<String>,
}

/// One manifest within a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub claim_generator: Option<String>,
    pub claim_generator_info: Vec<GeneratorInfo>,
    pub title: Option<String>,
    pub format: Option<String>,
    pub instance_id: Option<String>,
    pub assertions: Vec<Assertion>,
    pub ingredients: Vec<Ingredient>,
    pub signature_info: Option<SignatureInfo>,
    /// Identities attached from a CAWG report.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verified_identities: Vec<VerifiedIdentity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Assertion {
    pub label: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ingredient {
    pub title: Option<String>,
    pub format: Option<String>,
    pub instance_id: Option<String>,
    pub relationship: Option<String>,
    /// Label of the ingredient's own manifest within the store.
    pub active_manifest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureInfo {
    pub issuer: Option<String>,
    pub cert_serial_number: Option<String>,
    pub time: Option<String>,
}

impl Manifest {
    /// Assertions with exactly this label, in report order.
    pub fn assertions<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Assertion> + 'a {
        self.assertions.iter().filter(move |a| a.label == label)
    }

    /// Whether the training-mining assertion forbids or constrains AI use.
    ///
    /// The `cawg.` assertion takes precedence over the `c2pa.` one.
    pub fn do_not_train(&self) -> bool {
        let Some(entries) = TRAINING_MINING_LABELS.iter().find_map(|label| {
            self.assertions(label)
                .next()
                .and_then(|assertion| assertion.data.get("entries"))
                .filter(|entries| !entries.is_null())
        }) else {
            return false;
        };

        TRAINING_ENTRY_KEYS.iter().any(|key| {
            entries
                .get(key)
                .and_then(|entry| entry.get("use"))
                .and_then(Value::as_str)
                .is_some_and(|usage| NOT_ALLOWED_USES.contains(&usage))
        })
    }

    /// Human-readable name of the producing application.
    ///
    /// Prefers the first named `claim_generator_info` entry and falls back
    /// to parsing `claim_generator`.
    pub fn formatted_generator(&self) -> Option<String> {
        self.claim_generator_info
            .iter()
            .find_map(|info| info.name.clone().filter(|name| !name.is_empty()))
            .or_else(|| self.claim_generator.as_deref().map(parse_generator))
    }

    /// Whether the action history declares only human edits.
    ///
    /// Legacy `c2pa.actions` assertions disqualify a manifest; every
    /// `c2pa.actions.v2` assertion must include all actions and carry a
    /// wildcard `humanEdits` template.
    pub fn is_handmade(&self) -> bool {
        if self.assertions("c2pa.actions").next().is_some() {
            return false;
        }

        let mut actions = self.assertions("c2pa.actions.v2").peekable();
        if actions.peek().is_none() {
            return false;
        }

        actions.all(|assertion| {
            let all_included = assertion
                .data
                .get("allActionsIncluded")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let handmade_template = assertion
                .data
                .get("templates")
                .and_then(Value::as_array)
                .is_some_and(|templates| {
                    templates.iter().any(|template| {
                        template.get("action").and_then(Value::as_str) == Some("*")
                            && template.get("digitalSourceType").and_then(Value::as_str)
                                == Some(HUMAN_EDITS)
                    })
                });
            all_included && handmade_template
        })
    }

    /// Generative AI involvement recorded by this manifest, in report order.
    ///
    /// Covers actions (`c2pa.actions` and `c2pa.actions.v2`) whose digital
    /// source type is a generative one, and the legacy
    /// `com.adobe.generative-ai` assertion.
    pub fn generative_info(&self) -> Vec<GenerativeInfo<'_>> {
        let mut found = Vec::new();
        for assertion in &self.assertions {
            if assertion.label == LEGACY_GENERATIVE_LABEL {
                found.push(GenerativeInfo {
                    assertion,
                    action: None,
                    kind: GenerativeType::Legacy,
                    software_agent: legacy_software_agent(&assertion.data),
                });
                continue;
            }
            if !ACTION_LABELS.contains(&assertion.label.as_str()) {
                continue;
            }

            let actions = assertion
                .data
                .get("actions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for action in actions {
                let parameters = action.get("parameters");
                let source_type = action
                    .get("digitalSourceType")
                    .or_else(|| parameters?.get(PARAM_DIGITAL_SOURCE_TYPE))
                    .and_then(Value::as_str);
                let Some(kind) = source_type.and_then(GenerativeType::from_source_type) else {
                    continue;
                };

                let software_agent = action
                    .get("softwareAgent")
                    .and_then(|agent| serde_json::from_value::<SoftwareAgent>(agent.clone()).ok())
                    .or_else(|| {
                        let details = parameters?.get(PARAM_DETAILS)?.as_str()?;
                        Some(SoftwareAgent::Info(GeneratorInfo {
                            name: Some(details.to_string()),
                            version: None,
                        }))
                    });

                found.push(GenerativeInfo {
                    assertion,
                    action: Some(action),
                    kind,
                    software_agent,
                });
            }
        }
        found
    }

    /// The generative type to summarize this manifest with.
    ///
    /// A composite type wins over the others; otherwise the first entry.
    pub fn generative_type(&self) -> Option<GenerativeType> {
        let info = self.generative_info();
        info.iter()
            .map(|entry| entry.kind)
            .find(|kind| *kind == GenerativeType::CompositeWithTrainedAlgorithmicMedia)
            .or_else(|| info.first().map(|entry| entry.kind))
    }

    /// Verified identities of one CAWG type, e.g. `cawg.social_media`.
    pub fn verified_identities_of<'a>(
        &'a self,
        identity_type: &'a str,
    ) -> impl Iterator<Item = &'a VerifiedIdentity> + 'a {
        self.verified_identities
            .iter()
            .filter(move |identity| identity.identity_type == identity_type)
    }
}

fn legacy_software_agent(data: &Value) -> Option<SoftwareAgent> {
    let description = data.get("description").and_then(Value::as_str)?;
    let name = match data.get("version").and_then(Value::as_str) {
        Some(version) => format!("{description} {version}"),
        None => description.to_string(),
    };
    Some(SoftwareAgent::Text(name))
}

/// Kind of generative AI involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerativeType {
    TrainedAlgorithmicMedia,
    CompositeWithTrainedAlgorithmicMedia,
    AlgorithmicMedia,
    CompositeSynthetic,
    /// Recorded by the pre-standard `com.adobe.generative-ai` assertion.
    Legacy,
}

impl GenerativeType {
    /// Classify an IPTC digital source type URI. Non-generative types give
    /// `None`.
    pub fn from_source_type(uri: &str) -> Option<Self> {
        let term = DIGITAL_SOURCE_TYPE_PREFIXES
            .iter()
            .find_map(|prefix| uri.strip_prefix(prefix))?;
        match term {
            "trainedAlgorithmicMedia" => Some(Self::TrainedAlgorithmicMedia),
            "compositeWithTrainedAlgorithmicMedia" => {
                Some(Self::CompositeWithTrainedAlgorithmicMedia)
            }
            "algorithmicMedia" => Some(Self::AlgorithmicMedia),
            "compositeSynthetic" => Some(Self::CompositeSynthetic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrainedAlgorithmicMedia => "trainedAlgorithmicMedia",
            Self::CompositeWithTrainedAlgorithmicMedia => "compositeWithTrainedAlgorithmicMedia",
            Self::AlgorithmicMedia => "algorithmicMedia",
            Self::CompositeSynthetic => "compositeSynthetic",
            Self::Legacy => "legacy",
        }
    }
}

/// The tool that performed an action. Older manifests store a bare name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SoftwareAgent {
    Text(String),
    Info(GeneratorInfo),
}

impl SoftwareAgent {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Text(name) => Some(name),
            Self::Info(info) => info.name.as_deref(),
        }
    }
}

/// One generative AI entry found in a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerativeInfo<'a> {
    /// Assertion the entry was found in.
    pub assertion: &'a Assertion,
    /// The action within `assertion`, absent for legacy assertions.
    pub action: Option<&'a Value>,
    pub kind: GenerativeType,
    pub software_agent: Option<SoftwareAgent>,
}

/// CAWG identity reports keyed by manifest label.
pub type CawgReport = HashMap<String, Vec<CawgManifestReport>>;

/// One identity assertion report for a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CawgManifestReport {
    pub sig_type: String,
    pub referenced_assertions: Vec<String>,
    pub named_actor: NamedActor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamedActor {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    #[serde(rename = "type")]
    pub actor_type: Vec<String>,
    pub issuer: String,
    pub valid_from: Option<String>,
    pub verified_identities: Vec<VerifiedIdentity>,
    pub credential_schema: Vec<CredentialSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSchema {
    pub id: String,
    #[serde(rename = "type")]
    pub schema_type: String,
}

/// An identity a CAWG identity provider vouched for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerifiedIdentity {
    /// E.g. `cawg.social_media` or `cawg.document_verification`.
    #[serde(rename = "type")]
    pub identity_type: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub uri: Option<String>,
    pub verified_at: Option<String>,
    pub provider: Provider,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provider {
    pub id: String,
    pub name: String,
}

/// Parse the engine's serialized CAWG report.
pub fn deserialize_cawg_report(report: &str) -> Result<CawgReport> {
    serde_json::from_str(report)
        .map_err(|e| Error::InvalidReport(format!("malformed CAWG report: {e}")))
}

/// All verified identities across `reports`, in order.
pub fn verified_identities(reports: &[CawgManifestReport]) -> Vec<VerifiedIdentity> {
    reports
        .iter()
        .flat_map(|report| report.named_actor.verified_identities.iter().cloned())
        .collect()
}

/// Turn a claim generator string into a display name.
///
/// Handles both old-style XMP agent strings (`Adobe Photoshop 23.3.1 (Macintosh)`)
/// and User-Agent style strings (`Adobe_Photoshop/23.3.1 adobe_c2pa/0.12`).
pub fn parse_generator(value: &str) -> String {
    // Versions inside parentheses must not influence the match
    let mut without_parens = String::with_capacity(value.len());
    let mut depth = 0i32;
    for ch in value.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 => without_parens.push(ch),
            _ => {}
        }
    }

    if XMP_AGENT_VERSION.is_match(&without_parens) {
        return value.split('(').next().unwrap_or_default().trim().to_string();
    }

    let first_item = without_parens.split_whitespace().next().unwrap_or_default();
    let mut parts = first_item.split('/');
    let product = parts.next().unwrap_or_default().replace('_', " ");
    match parts.next() {
        Some(version) if !version.is_empty() => format!("{product} {version}"),
        _ => product,
    }
}
