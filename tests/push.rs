mod common;

use common::TestProject;
use werf::build::{BuildOptions, PushOptions, TagScheme};

const REPO: &str = "registry.example/testproj";

const UNNAMED_IMAGE: &str = "\
project: testproj
images:
- from: alpine:3.18
  shell:
    install:
    - echo hi
";

const NAMED_IMAGE: &str = "\
project: testproj
images:
- name: backend
  from: alpine:3.18
  shell:
    install:
    - echo hi
    setup:
    - echo done
";

fn push_opts(tags: &[(&str, TagScheme)], with_stages: bool) -> PushOptions {
    let mut opts = PushOptions {
        with_stages,
        ..Default::default()
    };
    for (tag, scheme) in tags {
        opts.tags_by_scheme
            .entry(*scheme)
            .or_default()
            .push(tag.to_string());
    }
    opts
}

#[tokio::test]
async fn publish_layer_is_labeled_and_pushed() {
    let project = TestProject::new(UNNAMED_IMAGE);
    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(&[("main", TagScheme::GitBranch)], false),
        )
        .await
        .unwrap();

    assert_eq!(project.pushes(), vec![format!("{REPO}:main")]);

    // The publish layer sits directly on the terminal stage image and
    // carries the scheme labels.
    let world = project.world.lock().unwrap();
    let published = world.images.get(&format!("{REPO}:main")).unwrap();
    let last_stage_name = conveyor.dimgs_in_order[0].latest_stage().image_name();
    let last_stage_id = world.images.get(last_stage_name).unwrap().id.clone();
    assert_eq!(published.parent.as_deref(), Some(last_stage_id.as_str()));
    assert_eq!(
        published.labels.get("dapp-tag-scheme").map(String::as_str),
        Some("git_branch")
    );
    assert_eq!(
        published.labels.get("dapp-dimg").map(String::as_str),
        Some("true")
    );
}

#[tokio::test]
async fn named_images_push_under_a_subrepository() {
    let project = TestProject::new(NAMED_IMAGE);
    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(&[("v1", TagScheme::Custom)], false),
        )
        .await
        .unwrap();

    assert_eq!(project.pushes(), vec![format!("{REPO}/backend:v1")]);
}

#[tokio::test]
async fn second_bp_run_issues_no_redundant_pushes() {
    let project = TestProject::new(UNNAMED_IMAGE);
    let opts = || push_opts(&[("main", TagScheme::GitBranch)], false);

    let mut first = project.conveyor();
    first
        .bp(REPO, BuildOptions::default(), opts())
        .await
        .unwrap();
    let pushes_after_first = project.pushes().len();
    let builds_after_first = project.builds().len();

    let mut second = project.conveyor();
    second
        .bp(REPO, BuildOptions::default(), opts())
        .await
        .unwrap();

    assert_eq!(project.pushes().len(), pushes_after_first);
    assert_eq!(project.builds().len(), builds_after_first);
}

#[tokio::test]
async fn stale_remote_parent_triggers_a_repush() {
    let project = TestProject::new(UNNAMED_IMAGE);
    {
        let mut world = project.world.lock().unwrap();
        world
            .remote_tags
            .insert(REPO.to_string(), vec!["main".to_string()]);
        world
            .remote_parents
            .insert(format!("{REPO}:main"), "sha256:stale".to_string());
    }

    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(&[("main", TagScheme::GitBranch)], false),
        )
        .await
        .unwrap();

    assert_eq!(project.pushes(), vec![format!("{REPO}:main")]);
}

#[tokio::test]
async fn unreadable_remote_parent_counts_as_stale() {
    let project = TestProject::new(UNNAMED_IMAGE);
    {
        let mut world = project.world.lock().unwrap();
        // The tag exists remotely but its parent id cannot be read.
        world
            .remote_tags
            .insert(REPO.to_string(), vec!["main".to_string()]);
    }

    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(&[("main", TagScheme::GitBranch)], false),
        )
        .await
        .unwrap();

    assert_eq!(project.pushes(), vec![format!("{REPO}:main")]);
}

#[tokio::test]
async fn with_stages_exports_every_absent_stage_tag() {
    let project = TestProject::new(NAMED_IMAGE);
    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(&[("v1", TagScheme::Custom)], true),
        )
        .await
        .unwrap();

    let signatures: Vec<String> = conveyor
        .get_dimg("backend")
        .unwrap()
        .stages
        .iter()
        .map(|s| s.signature().to_string())
        .collect();
    assert_eq!(signatures.len(), 3, "from, install, setup");

    let pushes = project.pushes();
    for signature in &signatures {
        let stage_ref = format!("{REPO}:dimgstage-{signature}");
        assert!(
            pushes.contains(&stage_ref),
            "stage cache ref {stage_ref} pushed, got {pushes:?}"
        );
    }
}

#[tokio::test]
async fn present_stage_tags_are_skipped_on_the_next_run() {
    let project = TestProject::new(NAMED_IMAGE);
    let opts = || push_opts(&[("v1", TagScheme::Custom)], true);

    let mut first = project.conveyor();
    first
        .bp(REPO, BuildOptions::default(), opts())
        .await
        .unwrap();
    let pushes_after_first = project.pushes().len();

    let mut second = project.conveyor();
    second
        .bp(REPO, BuildOptions::default(), opts())
        .await
        .unwrap();

    assert_eq!(
        project.pushes().len(),
        pushes_after_first,
        "stage cache and publish tags are all skipped"
    );
}

#[tokio::test]
async fn artifacts_are_never_published() {
    let yaml = "\
project: testproj
artifacts:
- name: libs
  from: golang:1.22
  shell:
    install:
    - go build -o /out ./...
images:
- name: app
  from: alpine:3.18
  import:
  - artifact: libs
    add: /out
    to: /opt/libs
    before: install
";
    let project = TestProject::new(yaml);
    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(&[("v1", TagScheme::Custom)], false),
        )
        .await
        .unwrap();

    let pushes = project.pushes();
    assert_eq!(pushes, vec![format!("{REPO}/app:v1")]);
    assert!(pushes.iter().all(|p| !p.contains("libs")));
}

#[tokio::test]
async fn every_scheme_tag_pair_is_published() {
    let project = TestProject::new(UNNAMED_IMAGE);
    let mut conveyor = project.conveyor();
    conveyor
        .bp(
            REPO,
            BuildOptions::default(),
            push_opts(
                &[
                    ("v1", TagScheme::Custom),
                    ("v2", TagScheme::Custom),
                    ("main", TagScheme::GitBranch),
                ],
                false,
            ),
        )
        .await
        .unwrap();

    let mut pushes = project.pushes();
    pushes.sort();
    assert_eq!(
        pushes,
        vec![
            format!("{REPO}:main"),
            format!("{REPO}:v1"),
            format!("{REPO}:v2"),
        ]
    );
}
