use anyhow::{Context, Result};

use crate::build::image::StageImage;
use crate::build::stage::{artifact_label, StageContext, CONTAINER_WERF_DIR};
use crate::config::model::ArtifactImport;
use crate::docker::RunSpec;
use crate::identity::slug;
use crate::util::sha256_hex;

/// Mutate the build recipe for one import entry: mount the exported artifact
/// tree read-only and copy it into place with the declared filters.
pub fn prepare_import(
    ctx: &dyn StageContext,
    entry: &ArtifactImport,
    image: &mut StageImage,
) -> Result<()> {
    let import_container_path = import_container_path(entry);
    let command = generate_safe_cp(
        &import_container_path,
        &entry.to,
        &entry.owner,
        &entry.group,
        &entry.include_paths,
        &entry.exclude_paths,
    );

    let (host_tmp, container_tmp) = artifact_tmp_dirs(ctx, entry);
    image
        .recipe
        .add_volume(format!("{}:{}:ro", host_tmp.display(), container_tmp));
    image.recipe.add_service_run_command(command);

    let signature = ctx.image_latest_stage_signature(&entry.artifact)?;
    image
        .recipe
        .add_label(artifact_label(&entry.artifact), signature);
    Ok(())
}

/// Export the artifact's source tree into the host tmp dir by running its
/// latest-stage image with the artifact dir mounted read-write.
pub async fn prepare_import_data(ctx: &dyn StageContext, entry: &ArtifactImport) -> Result<()> {
    let (host_tmp, container_tmp) = artifact_tmp_dirs(ctx, entry);
    tokio::fs::create_dir_all(&host_tmp)
        .await
        .with_context(|| format!("creating artifact export dir {}", host_tmp.display()))?;

    let import_container_path = import_container_path(entry);
    let export_command = generate_safe_cp(&entry.add, &import_container_path, "", "", &[], &[]);

    let image = ctx
        .image_latest_stage_image_name(&entry.artifact)
        .with_context(|| format!("resolving artifact image `{}`", entry.artifact))?;

    ctx.engine()
        .run(&RunSpec {
            image,
            script: export_command,
            volumes: vec![format!("{}:{}", host_tmp.display(), container_tmp)],
        })
        .await
        .with_context(|| format!("exporting artifact `{}`", entry.artifact))?;
    Ok(())
}

/// Per-import export folder inside the mounted artifact dir, keyed by the
/// import's declarative fields.
fn import_container_path(entry: &ArtifactImport) -> String {
    let mut fields = vec![
        entry.artifact.clone(),
        entry.add.clone(),
        entry.to.clone(),
        entry.owner.clone(),
        entry.group.clone(),
    ];
    fields.extend(entry.include_paths.clone());
    fields.extend(entry.exclude_paths.clone());
    let folder = sha256_hex(&fields);
    format!("{}/{}", artifact_container_dir(entry), folder)
}

fn artifact_tmp_dirs(
    ctx: &dyn StageContext,
    entry: &ArtifactImport,
) -> (std::path::PathBuf, String) {
    let name_part = slug(&entry.artifact);
    let host = ctx.tmp_dir().join("artifact").join(&name_part);
    (host, artifact_container_dir(entry))
}

fn artifact_container_dir(entry: &ArtifactImport) -> String {
    format!("{CONTAINER_WERF_DIR}/artifact/{}", slug(&entry.artifact))
}

/// Generate the copy command for one import: create the destination dir and
/// invoke rsync with the include/exclude filter chain.
///
/// With includes present, excludes are emitted first so an exclusion always
/// wins over an inclusion matching the same path. Each include gets an
/// ascending chain of allow rules for its path prefixes, then itself and its
/// subtree, and everything else under `from` is cut off by a trailing deny.
pub fn generate_safe_cp(
    from: &str,
    to: &str,
    owner: &str,
    group: &str,
    include_paths: &[String],
    exclude_paths: &[String],
) -> String {
    let mkdir_command = format!("mkdir -p {}", parent_dir(to));

    let mut rsync_command = String::from("rsync --archive --links --inplace");
    if !owner.is_empty() || !group.is_empty() {
        rsync_command.push_str(&format!(" --chown={owner}:{group}"));
    }

    if !include_paths.is_empty() {
        for path in exclude_paths {
            rsync_command.push_str(&format!(" --filter='-/ {}'", join_path(from, path)));
        }

        for path in include_paths {
            let target = join_path(from, path);
            for part in descent_path(&target) {
                rsync_command.push_str(&format!(" --filter='+/ {part}'"));
            }
            // The user may have meant a directory or a file; allow both the
            // path itself and everything beneath it.
            rsync_command.push_str(&format!(" --filter='+/ {target}'"));
            rsync_command.push_str(&format!(" --filter='+/ {}'", join_path(&target, "**")));
        }

        rsync_command.push_str(&format!(" --filter='-/ {}'", join_path(from, "**")));
    } else {
        for path in exclude_paths {
            rsync_command.push_str(&format!(" --filter='-/ {}'", join_path(from, path)));
        }
    }

    // The trailing slash tells rsync to copy the directory contents rather
    // than the directory itself; whether `from` is a directory is only known
    // inside the container.
    rsync_command.push_str(&format!(
        " $(if [ -d {from} ] ; then echo {from}/ ; else echo {from} ; fi) {to}"
    ));

    format!("{mkdir_command} && {rsync_command}")
}

/// Path prefixes of `path` from the root down, excluding `path` itself.
fn descent_path(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = parent_dir(path);
    while current != parent_dir(&current) {
        parts.push(current.clone());
        current = parent_dir(&current);
    }
    parts.reverse();
    parts
}

fn parent_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

fn join_path(base: &str, rest: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'))
}
