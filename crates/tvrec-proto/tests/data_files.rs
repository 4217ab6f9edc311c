use chrono::{FixedOffset, TimeZone, Utc};
use std::path::Path;
use tvrec_proto::config::Config;
use tvrec_proto::guide::{JsonGuideStore, MetadataStore};
use tvrec_proto::naming;
use tvrec_proto::state::{Schedule, StateStore};

const GUIDE: &str = r#"{
    "channels": [
        {"id": "bbc1", "title": "BBC One", "stream_url": "plugin://plugin.video.iplayer/?ch=bbc1"},
        {"id": "arte", "title": "Arte/HD", "stream_url": "https://arte.example/live.m3u8"}
    ],
    "programs": [
        {"channel": "bbc1", "title": "Doctor Who?", "start_date": 1704139200, "end_date": 1704142800,
         "season": "14", "episode": "3", "autoplaywith_scheduled": true},
        {"channel": "arte", "title": "Les Misérables", "start_date": 1704146400, "end_date": 1704157200,
         "is_movie": true}
    ]
}"#;

fn write_config(dir: &Path) -> Config {
    let config_path = dir.join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
            [paths]
            capture_dir = "{root}/recordings"
            guide_file = "{root}/guide.json"
            state_file = "{root}/state.json"

            [capture]
            before_minutes = 2
            after_minutes = 10

            [service]
            mode = "1"
            time = "05:45"
            "#,
            root = dir.display()
        ),
    )
    .unwrap();
    Config::load_from(&config_path).unwrap()
}

#[tokio::test]
async fn config_state_and_guide_work_together() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(&config.paths.guide_file, GUIDE).unwrap();

    // schedule comes from config until the state file says otherwise
    let state = StateStore::new(config.paths.state_file.clone(), &config.service);
    assert_eq!(state.load().await.schedule(), Schedule::FixedTime(Some((5, 45))));
    state.record_run(1704139200.0).await.unwrap();
    let mut stored = state.load().await;
    assert_eq!(stored.last_run(), 1704139200.0);
    stored.schedule_mode = "0".into();
    stored.interval_selector = "3".into();
    state.save(&stored).await.unwrap();
    assert_eq!(state.load().await.schedule(), Schedule::Interval { secs: 86400 });

    let store = JsonGuideStore::new(config.paths.guide_file.clone());
    let start = Utc.timestamp_opt(1704139200, 0).unwrap();
    let reference = store.stream_url("bbc1").await.unwrap().unwrap();
    assert!(!tvrec_proto::guide::is_network_url(&reference));
    let program = store.program_at("bbc1", start).await.unwrap().unwrap();

    let pending = store
        .pending_captures(start - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(pending, vec![program.clone()]);

    let root = config.paths.capture_dir.clone().unwrap();
    let recorded_at = FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 1, 1, 19, 58, 30)
        .unwrap();
    let target = naming::target_path(&root, "bbc1", &program, &recorded_at);
    assert_eq!(
        target,
        root.join("TVShows")
            .join("Doctor Who")
            .join("bbc1 - Doctor Who S14E3 - 2024-01-01 19-58.ts")
    );
    naming::ensure_folder(target.parent().unwrap()).await.unwrap();
    naming::ensure_folder(target.parent().unwrap()).await.unwrap();
}

#[tokio::test]
async fn movie_goes_under_movies_with_unicode_title_kept() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(&config.paths.guide_file, GUIDE).unwrap();

    let store = JsonGuideStore::new(config.paths.guide_file.clone());
    let start = Utc.timestamp_opt(1704146400, 0).unwrap();
    let program = store.program_at("arte", start).await.unwrap().unwrap();
    assert!(program.is_movie);
    assert_eq!(program.duration_secs(), 3 * 3600);

    let root = config.paths.capture_dir.clone().unwrap();
    let folder = naming::program_folder(&root, &program);
    assert_eq!(folder, root.join("Movies").join("Les Misérables"));
    assert_eq!(naming::sanitize("Arte/HD"), "ArteHD");
}

#[tokio::test]
async fn missing_guide_is_an_error_not_an_empty_result() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonGuideStore::new(dir.path().join("absent.json"));
    assert!(store.stream_url("bbc1").await.is_err());
}
