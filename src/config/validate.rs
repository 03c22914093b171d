// The miette/thiserror derive macros generate code that triggers false
// positive unused_assignments warnings on enum variant fields.
#![allow(unused_assignments)]

use std::collections::HashSet;

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::config::model::{ArtifactImport, ImageConfig, WerfConfig};

// ---------------------------------------------------------------------------
// ConfigError — miette-powered validation error
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("config file could not be parsed")]
    #[diagnostic(code(werf::config_parse))]
    Parse {
        #[source_code]
        src: NamedSource<String>,
        #[label("{message}")]
        span: SourceSpan,
        message: String,
    },

    #[error("project name is empty")]
    #[diagnostic(code(werf::empty_project_name))]
    EmptyProjectName {
        #[source_code]
        src: NamedSource<String>,
        #[label("set `project` to a short identifier")]
        span: SourceSpan,
    },

    #[error("image name `{name}` is declared more than once")]
    #[diagnostic(code(werf::duplicate_image_name))]
    DuplicateImageName {
        #[source_code]
        src: NamedSource<String>,
        #[label("duplicate declaration")]
        span: SourceSpan,
        name: String,
    },

    #[error("more than one unnamed image")]
    #[diagnostic(
        code(werf::duplicate_unnamed_image),
        help("only a single image may omit `name`")
    )]
    DuplicateUnnamedImage {
        #[source_code]
        src: NamedSource<String>,
        #[label("a second image without a name")]
        span: SourceSpan,
    },

    #[error("artifact without a name")]
    #[diagnostic(code(werf::unnamed_artifact), help("artifacts are addressed by name in `import`"))]
    UnnamedArtifact {
        #[source_code]
        src: NamedSource<String>,
        #[label("give this artifact a name")]
        span: SourceSpan,
    },

    #[error("image `{name}` declares both `from` and `fromImage`")]
    #[diagnostic(code(werf::base_image_conflict))]
    BaseImageConflict {
        #[source_code]
        src: NamedSource<String>,
        #[label("choose exactly one base")]
        span: SourceSpan,
        name: String,
    },

    #[error("image `{name}` declares neither `from` nor `fromImage`")]
    #[diagnostic(code(werf::base_image_missing))]
    BaseImageMissing {
        #[source_code]
        src: NamedSource<String>,
        #[label("a base image is required")]
        span: SourceSpan,
        name: String,
    },

    #[error("import without an artifact name in image `{image}`")]
    #[diagnostic(code(werf::import_artifact_required))]
    ImportArtifactRequired {
        #[source_code]
        src: NamedSource<String>,
        #[label("`artifact: NAME` is required for import")]
        span: SourceSpan,
        image: String,
    },

    #[error("import of `{artifact}` sets both `before` and `after`")]
    #[diagnostic(
        code(werf::import_relation_conflict),
        help("specify only one of `before: install|setup` or `after: install|setup`")
    )]
    ImportRelationConflict {
        #[source_code]
        src: NamedSource<String>,
        #[label("both boundaries set")]
        span: SourceSpan,
        artifact: String,
    },

    #[error("import of `{artifact}` sets neither `before` nor `after`")]
    #[diagnostic(
        code(werf::import_relation_missing),
        help("specify one of `before: install|setup` or `after: install|setup`")
    )]
    ImportRelationMissing {
        #[source_code]
        src: NamedSource<String>,
        #[label("an import stage boundary is required")]
        span: SourceSpan,
        artifact: String,
    },

    #[error("invalid import stage `{relation}` for `{artifact}`")]
    #[diagnostic(code(werf::import_relation_invalid), help("expected install or setup"))]
    ImportRelationInvalid {
        #[source_code]
        src: NamedSource<String>,
        #[label("expected install or setup")]
        span: SourceSpan,
        artifact: String,
        relation: String,
    },

    #[error("no such artifact `{artifact}`")]
    #[diagnostic(code(werf::unknown_artifact))]
    UnknownArtifact {
        #[source_code]
        src: NamedSource<String>,
        #[label("image `{image}` imports from an artifact that is not declared")]
        span: SourceSpan,
        image: String,
        artifact: String,
    },

    #[error("git mapping in image `{image}` has an empty `to`")]
    #[diagnostic(code(werf::git_to_required))]
    GitToRequired {
        #[source_code]
        src: NamedSource<String>,
        #[label("destination path is required")]
        span: SourceSpan,
        image: String,
    },
}

/// Validate a parsed config against its raw source text. All violations are
/// collected; the caller decides how to render them.
pub fn validate(
    config: &WerfConfig,
    source: &str,
    filename: &str,
) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let src = || NamedSource::new(filename, source.to_string());

    if let Some(project) = &config.project {
        if project.trim().is_empty() {
            errors.push(ConfigError::EmptyProjectName {
                src: src(),
                span: find_key_span(source, "project"),
            });
        }
    }

    // --- Name uniqueness across images and artifacts ---
    let mut seen: HashSet<&str> = HashSet::new();
    let mut unnamed_seen = false;
    for image in config.images.iter().chain(config.artifacts.iter()) {
        if image.name.is_empty() {
            if unnamed_seen {
                errors.push(ConfigError::DuplicateUnnamedImage {
                    src: src(),
                    span: (0, 0).into(),
                });
            }
            unnamed_seen = true;
        } else if !seen.insert(image.name.as_str()) {
            errors.push(ConfigError::DuplicateImageName {
                src: src(),
                span: find_name_span(source, &image.name),
                name: image.name.clone(),
            });
        }
    }

    for artifact in &config.artifacts {
        if artifact.name.is_empty() {
            errors.push(ConfigError::UnnamedArtifact {
                src: src(),
                span: find_key_span(source, "artifacts"),
            });
        }
    }

    let artifact_names: HashSet<&str> =
        config.artifacts.iter().map(|a| a.name.as_str()).collect();

    for image in config.images.iter().chain(config.artifacts.iter()) {
        validate_base(image, source, filename, &mut errors);
        for spec in &image.git {
            if spec.to.trim().is_empty() {
                errors.push(ConfigError::GitToRequired {
                    src: src(),
                    span: find_name_span(source, &image.name),
                    image: image.name.clone(),
                });
            }
        }
        for import in &image.import {
            validate_import(image, import, &artifact_names, source, filename, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_base(image: &ImageConfig, source: &str, filename: &str, errors: &mut Vec<ConfigError>) {
    let src = NamedSource::new(filename, source.to_string());
    match (&image.from, &image.from_image) {
        (Some(_), Some(_)) => errors.push(ConfigError::BaseImageConflict {
            src,
            span: find_name_span(source, &image.name),
            name: image.name.clone(),
        }),
        (None, None) => errors.push(ConfigError::BaseImageMissing {
            src,
            span: find_name_span(source, &image.name),
            name: image.name.clone(),
        }),
        _ => {}
    }
}

fn validate_import(
    image: &ImageConfig,
    import: &ArtifactImport,
    artifact_names: &HashSet<&str>,
    source: &str,
    filename: &str,
    errors: &mut Vec<ConfigError>,
) {
    let src = || NamedSource::new(filename, source.to_string());

    if import.artifact.is_empty() {
        errors.push(ConfigError::ImportArtifactRequired {
            src: src(),
            span: find_name_span(source, &image.name),
            image: image.name.clone(),
        });
        return;
    }

    match (&import.before, &import.after) {
        (Some(_), Some(_)) => errors.push(ConfigError::ImportRelationConflict {
            src: src(),
            span: find_name_span(source, &import.artifact),
            artifact: import.artifact.clone(),
        }),
        (None, None) => errors.push(ConfigError::ImportRelationMissing {
            src: src(),
            span: find_name_span(source, &import.artifact),
            artifact: import.artifact.clone(),
        }),
        (Some(rel), None) | (None, Some(rel)) => {
            if !ArtifactImport::relation_is_valid(rel) {
                errors.push(ConfigError::ImportRelationInvalid {
                    src: src(),
                    span: find_name_span(source, rel),
                    artifact: import.artifact.clone(),
                    relation: rel.clone(),
                });
            }
        }
    }

    if !artifact_names.contains(import.artifact.as_str()) {
        errors.push(ConfigError::UnknownArtifact {
            src: src(),
            span: find_name_span(source, &import.artifact),
            image: image.name.clone(),
            artifact: import.artifact.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// Source span helpers
// ---------------------------------------------------------------------------

/// Find the byte offset of a `name: value` occurrence for the given value.
fn find_name_span(source: &str, name: &str) -> SourceSpan {
    if name.is_empty() {
        return (0, 0).into();
    }
    for pat in [format!("name: {name}"), format!("artifact: {name}")] {
        if let Some(pos) = source.find(&pat) {
            let value_start = pos + pat.len() - name.len();
            return (value_start, name.len()).into();
        }
    }
    if let Some(pos) = source.find(name) {
        return (pos, name.len()).into();
    }
    (0, 0).into()
}

/// Find the byte offset of a top-level YAML key.
fn find_key_span(source: &str, key: &str) -> SourceSpan {
    let pat = format!("{key}:");
    if let Some(pos) = source.find(&pat) {
        return (pos, key.len()).into();
    }
    (0, 0).into()
}
