//! SLSA v1 in-toto provenance statement builder.
//!
//! See `spec.md` §4.6. Grounded on `examples/original_source/pkg/jnproxy/
//! internal/slsa/attestation.go`, the more complete of the two attestation
//! packages in the upstream source (`pkg/session/internal/slsa` carries an
//! older, non-`back-position` `buildType` and is not used here — see
//! `spec.md` §9's Open Question and `DESIGN.md`).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http_proxy::handler::ResourceDescriptor;
use crate::repository::DigestSet;

pub const BUILD_TYPE: &str = "https://slsa-framework/jupyter-lineage/back-position/0.1";
const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";
const PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v1";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Builder {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subject {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    #[serde(rename = "digest", skip_serializing_if = "DigestSet::is_empty", default)]
    pub digest_set: DigestSet,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BuildDefinition {
    #[serde(rename = "buildType")]
    build_type: String,
    #[serde(rename = "internalParameters", skip_serializing_if = "Option::is_none")]
    internal_parameters: Option<Value>,
    #[serde(rename = "resolvedDependencies", skip_serializing_if = "Vec::is_empty", default)]
    resolved_dependencies: Vec<ResourceDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BuildMetadata {
    #[serde(rename = "invocationID", skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(rename = "startedOn", skip_serializing_if = "String::is_empty", default)]
    started_on: String,
    #[serde(rename = "finishedOn", skip_serializing_if = "String::is_empty", default)]
    finished_on: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunDetails {
    builder: Builder,
    #[serde(rename = "metadata")]
    build_metadata: BuildMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Predicate {
    #[serde(rename = "buildDefinition")]
    build_definition: BuildDefinition,
    #[serde(rename = "runDetails")]
    run_details: RunDetails,
}

/// A complete in-toto attestation statement, ready to be serialized to
/// `prov.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "_type")]
    statement_type: String,
    #[serde(rename = "predicateType")]
    predicate_type: String,
    subject: Vec<Subject>,
    predicate: Predicate,
}

/// Everything needed to build one [`Statement`].
pub struct ProvenanceInput {
    pub builder: Builder,
    pub subjects: Vec<Subject>,
    pub repository_uri: String,
    pub repository_digest: DigestSet,
    pub descriptors: Vec<ResourceDescriptor>,
    pub started_on: DateTime<Utc>,
    pub finished_on: DateTime<Utc>,
}

/// Builds and caches a single [`Statement`] for the lifetime of a session.
/// `build()` is idempotent: once a statement has been produced it is
/// returned (as a clone) on every subsequent call rather than recomputed,
/// matching the "call `Stop()` then `Provenance()` any number of times"
/// contract in `spec.md` §4.7.
#[derive(Default)]
pub struct ProvenanceBuilder {
    cached: Mutex<Option<Statement>>,
}

impl ProvenanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&self, input: ProvenanceInput) -> Statement {
        let mut cached = self.cached.lock().expect("provenance cache poisoned");
        if let Some(statement) = cached.as_ref() {
            return statement.clone();
        }

        // The repository entry leads `resolvedDependencies`, matching
        // `pkg/session/internal/slsa/slsa.go`'s
        // `append([]Dependency{}, repo)` followed by `AddDependencies(deps...)`.
        let mut resolved_dependencies = vec![ResourceDescriptor {
            uri: Some(input.repository_uri),
            digest: input.repository_digest,
            ..Default::default()
        }];
        resolved_dependencies.extend(input.descriptors);

        let statement = Statement {
            statement_type: STATEMENT_TYPE.to_string(),
            predicate_type: PREDICATE_TYPE.to_string(),
            subject: input.subjects,
            predicate: Predicate {
                build_definition: BuildDefinition {
                    build_type: BUILD_TYPE.to_string(),
                    internal_parameters: None,
                    resolved_dependencies,
                },
                run_details: RunDetails {
                    builder: input.builder,
                    build_metadata: BuildMetadata {
                        invocation_id: None,
                        started_on: input.started_on.to_rfc3339(),
                        finished_on: input.finished_on.to_rfc3339(),
                    },
                },
            },
        };

        *cached = Some(statement.clone());
        statement
    }
}
