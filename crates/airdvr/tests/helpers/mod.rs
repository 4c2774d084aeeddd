use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use airdvr::{
    events::{EventBus, PlayerEvent},
    manifest::{ManifestFetcher, ManifestSnapshot, SegmentDescriptor},
    store::{EvictionGuard, SegmentStore, StoreTuning},
    Channel, EvictionPolicy,
};

pub const MANIFEST_FILE: &str = "chunklist_DVR.m3u8";

pub fn playlist_body(first: u64, count: u64) -> String {
    let mut body = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:{first}\n"
    );
    for index in first..first + count {
        body.push_str(&format!("#EXTINF:10.000,\n{}\n", segment_file(index)));
    }
    body
}

pub fn segment_file(index: u64) -> String {
    format!("media_w1_{index}.aac")
}

pub struct TestChannel {
    pub channel: Channel,
    pub fetcher: ManifestFetcher,
    pub store: Arc<SegmentStore>,
    pub snapshot: Arc<RwLock<ManifestSnapshot>>,
    pub guard: Arc<EvictionGuard>,
    pub events: EventBus,
    pub server: MockServer,
    pub dir: tempfile::TempDir,
    base_url: Url,
    client: reqwest::Client,
    policy: EvictionPolicy,
    tuning: StoreTuning,
}

impl TestChannel {
    pub async fn new(tuning: StoreTuning, policy: EvictionPolicy) -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel(0);
        let client = reqwest::Client::new();
        let events = EventBus::default();
        let guard = EvictionGuard::new();
        let snapshot = Arc::new(RwLock::new(ManifestSnapshot::default()));

        let base_url = Url::parse(&format!("{}/", server.uri())).unwrap();
        let fetcher = ManifestFetcher::new(
            channel,
            client.clone(),
            base_url.join(MANIFEST_FILE).unwrap(),
            snapshot.clone(),
            Duration::from_millis(500),
            events.clone(),
        );
        let store = SegmentStore::new(
            channel,
            base_url.clone(),
            dir.path().to_path_buf(),
            client.clone(),
            snapshot.clone(),
            guard.clone(),
            policy,
            tuning,
            events.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        Self {
            channel,
            fetcher,
            store,
            snapshot,
            guard,
            events,
            server,
            dir,
            base_url,
            client,
            policy,
            tuning,
        }
    }

    /// Build a fresh store over the same cache directory, as a process
    /// restart would.
    pub fn reopen_store(&self) -> Arc<SegmentStore> {
        SegmentStore::new(
            self.channel,
            self.base_url.clone(),
            self.dir.path().to_path_buf(),
            self.client.clone(),
            self.snapshot.clone(),
            self.guard.clone(),
            self.policy,
            self.tuning,
            self.events.clone(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    pub async fn mock_manifest(&self, body: &str, expect: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/{MANIFEST_FILE}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(expect)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_segment(&self, index: u64, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/{}", segment_file(index))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;
    }

    /// Insert descriptors directly, bypassing the fetcher.
    pub async fn seed_snapshot(&self, first: u64, count: u64) {
        let mut snapshot = self.snapshot.write().await;
        for index in first..first + count {
            snapshot.segments.insert(
                index,
                SegmentDescriptor {
                    index,
                    duration_ms: 10_000,
                    file_name: segment_file(index),
                },
            );
        }
        snapshot.loaded_at = Some(chrono::Utc::now());
    }

    pub fn write_segment_file(&self, index: u64, body: &[u8]) {
        std::fs::write(self.dir.path().join(segment_file(index)), body).unwrap();
    }

    pub fn segment_exists(&self, index: u64) -> bool {
        self.dir.path().join(segment_file(index)).is_file()
    }
}

pub async fn wait_segment_ready(
    rx: &mut broadcast::Receiver<PlayerEvent>,
    channel: Channel,
    index: u64,
) {
    let wait = async {
        loop {
            match rx.recv().await.unwrap() {
                PlayerEvent::SegmentReady {
                    channel: c,
                    index: i,
                } if c == channel && i == index => return,
                _ => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("segment never became ready");
}
