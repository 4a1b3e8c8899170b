#[cfg(test)]
mod integration_tests {
    use crate::{
        decode_png, encode_png, partition, Cancellation, Capturer, Comparator, CompositeLayout,
        Config, DiffEngine, DiffError, DiffOptions, ErrorScope, MockCommentPoster,
        MockObjectStore, Pipeline, Publisher, RunStatus, Screenshot, Side, StoryCatalog, StoryRef,
    };
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    struct StubCatalog {
        result: Result<Vec<StoryRef>, DiffError>,
    }

    #[async_trait]
    impl StoryCatalog for StubCatalog {
        async fn stories(&self) -> Result<Vec<StoryRef>, DiffError> {
            self.result.clone()
        }
    }

    /// Serves prepared renders per story label
    #[derive(Default)]
    struct StubCapturer {
        renders: HashMap<String, (Vec<u8>, Vec<u8>)>,
        timing_out: HashSet<String>,
        calls: AtomicUsize,
    }

    impl StubCapturer {
        fn render(mut self, story: &StoryRef, baseline: &RgbaImage, candidate: &RgbaImage) -> Self {
            self.renders.insert(
                story.label(),
                (encode_png(baseline).unwrap(), encode_png(candidate).unwrap()),
            );
            self
        }

        fn time_out(mut self, story: &StoryRef) -> Self {
            self.timing_out.insert(story.label());
            self
        }
    }

    #[async_trait]
    impl Capturer for StubCapturer {
        async fn capture(&self, story: &StoryRef, url: &str, side: Side) -> Result<Screenshot, DiffError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.timing_out.contains(&story.label()) {
                return Err(DiffError::Timeout(Duration::from_secs(30)));
            }

            let (baseline, candidate) = self
                .renders
                .get(&story.label())
                .ok_or_else(|| DiffError::capture(url, "unknown story"))?;
            let data = match side {
                Side::Baseline => baseline.clone(),
                Side::Candidate => candidate.clone(),
            };
            Ok(Screenshot {
                story: story.label(),
                side,
                url: url.to_string(),
                data,
            })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.batch_size = 2;
        config.publish.github.pull_request = Some(42);
        config.publish.commit_sha = Some("abc123".to_string());
        config
    }

    fn pipeline(
        config: Config,
        stories: Result<Vec<StoryRef>, DiffError>,
        capturer: Arc<StubCapturer>,
        cancellation: Cancellation,
    ) -> Pipeline {
        let comparator = Arc::new(Comparator::new(
            capturer,
            "http://baseline.test/iframe.html",
            "http://candidate.test/iframe.html",
            DiffEngine::new(DiffOptions::default()),
            CompositeLayout::default(),
        ));
        Pipeline::new(
            config,
            Arc::new(StubCatalog { result: stories }),
            comparator,
            cancellation,
        )
    }

    fn untouched_publisher() -> Publisher {
        Publisher::new(
            Arc::new(MockObjectStore::new()),
            Arc::new(MockCommentPoster::new()),
        )
    }

    fn with_red_block(image: &RgbaImage) -> RgbaImage {
        let mut changed = image.clone();
        for x in 2..6 {
            for y in 2..6 {
                changed.put_pixel(x, y, RED);
            }
        }
        changed
    }

    fn stories(names: &[&str]) -> Vec<StoryRef> {
        names.iter().map(|name| StoryRef::new("Button", *name)).collect()
    }

    #[tokio::test]
    async fn test_identical_catalog_is_clean() {
        let stories = stories(&["primary", "secondary", "disabled"]);
        let image = RgbaImage::from_pixel(16, 16, WHITE);
        let capturer = stories.iter().fold(StubCapturer::default(), |capturer, story| {
            capturer.render(story, &image, &image)
        });
        let capturer = Arc::new(capturer);

        let batches = partition(&stories, 2);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);

        let summary = pipeline(test_config(), Ok(stories), capturer.clone(), Cancellation::new())
            .with_publisher(untouched_publisher())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.stories, 3);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.compared, 3);
        assert_eq!(summary.differences, 0);
        assert!(summary.failures.is_empty());
        assert!(summary.report_location.is_none());
        assert_eq!(summary.status, RunStatus::Clean);
        assert_eq!(summary.status.exit_code(), 0);
        assert_eq!(capturer.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_differing_story_is_reported_and_published() {
        let story = StoryRef::new("Card", "wide");
        let baseline = RgbaImage::from_pixel(400, 20, WHITE);
        let candidate = with_red_block(&baseline);
        let capturer = Arc::new(StubCapturer::default().render(&story, &baseline, &candidate));

        let mut store = MockObjectStore::new();
        store
            .expect_put_public()
            .withf(|key, data, content_type| {
                key == "abc123.png"
                    && content_type == "image/png"
                    && decode_png(data).map(|report| report.width() == 1024).unwrap_or(false)
            })
            .times(1)
            .returning(|key, _, _| Ok(format!("https://bucket.s3.amazonaws.com/{key}")));

        let mut poster = MockCommentPoster::new();
        poster
            .expect_post_comment()
            .withf(|thread, body| {
                *thread == 42 && body.contains("https://bucket.s3.amazonaws.com/abc123.png")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let summary = pipeline(test_config(), Ok(vec![story]), capturer, Cancellation::new())
            .with_publisher(Publisher::new(Arc::new(store), Arc::new(poster)))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.differences, 1);
        assert!(summary.differences <= summary.stories);
        assert!(summary.report_error.is_none());
        assert_eq!(
            summary.report_location.as_deref(),
            Some("https://bucket.s3.amazonaws.com/abc123.png")
        );
        assert_eq!(summary.status, RunStatus::DifferencesFound);
        assert_eq!(summary.status.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_report_is_written_to_disk() {
        let story = StoryRef::new("Card", "wide");
        let baseline = RgbaImage::from_pixel(400, 20, WHITE);
        let candidate = with_red_block(&baseline);
        let capturer = Arc::new(StubCapturer::default().render(&story, &baseline, &candidate));

        let path = std::env::temp_dir().join(format!("story-diff-{}.png", uuid::Uuid::new_v4()));
        let mut config = test_config();
        config.report.report_path = Some(path.clone());

        let summary = pipeline(config, Ok(vec![story]), capturer, Cancellation::new())
            .run()
            .await
            .unwrap();

        let written = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let report = decode_png(&written).unwrap();

        // 2 * margin + 3 * 400 + 2 * gap wide, scaled down
        let composite_width: f64 = 2.0 * 40.0 + 3.0 * 400.0 + 2.0 * 100.0;
        let composite_height = 2.0 * 40.0 + 100.0 + 20.0;
        let expected_height = (composite_height * 1024.0 / composite_width).round() as u32;
        assert_eq!(report.width(), 1024);
        assert_eq!(report.height(), expected_height);
        assert_eq!(
            summary.report_location,
            Some(path.display().to_string())
        );
    }

    #[tokio::test]
    async fn test_unwritable_report_path_still_publishes() {
        let story = StoryRef::new("Card", "wide");
        let image = RgbaImage::from_pixel(16, 16, WHITE);
        let capturer = Arc::new(StubCapturer::default().render(&story, &image, &with_red_block(&image)));

        let mut config = test_config();
        config.report.report_path = Some(
            std::env::temp_dir()
                .join(format!("story-diff-missing-{}", uuid::Uuid::new_v4()))
                .join("report.png"),
        );

        let mut store = MockObjectStore::new();
        store
            .expect_put_public()
            .times(1)
            .returning(|key, _, _| Ok(format!("https://bucket.s3.amazonaws.com/{key}")));
        let mut poster = MockCommentPoster::new();
        poster.expect_post_comment().times(1).returning(|_, _| Ok(()));

        let summary = pipeline(config, Ok(vec![story]), capturer, Cancellation::new())
            .with_publisher(Publisher::new(Arc::new(store), Arc::new(poster)))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.differences, 1);
        assert!(matches!(summary.report_error, Some(DiffError::Io(_))));
        assert!(summary.publish_error.is_none());
        assert_eq!(
            summary.report_location.as_deref(),
            Some("https://bucket.s3.amazonaws.com/abc123.png")
        );
        assert_eq!(summary.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_enumeration_failure_aborts_run() {
        let capturer = Arc::new(StubCapturer::default());
        let result = pipeline(
            test_config(),
            Err(DiffError::Enumeration("registry never appeared".to_string())),
            capturer.clone(),
            Cancellation::new(),
        )
        .with_publisher(untouched_publisher())
        .run()
        .await;

        let error = result.unwrap_err();
        assert!(matches!(error, DiffError::Enumeration(_)));
        assert!(error.is_fatal());
        assert_eq!(capturer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capture_timeout_skips_only_that_story() {
        let stories = stories(&["slow", "changed", "same"]);
        let image = RgbaImage::from_pixel(16, 16, WHITE);
        let capturer = Arc::new(
            StubCapturer::default()
                .time_out(&stories[0])
                .render(&stories[1], &image, &with_red_block(&image))
                .render(&stories[2], &image, &image),
        );

        let summary = pipeline(test_config(), Ok(stories), capturer, Cancellation::new())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.compared, 2);
        assert_eq!(summary.differences, 1);
        assert_eq!(summary.failures.len(), 1);

        let failure = &summary.failures[0];
        assert_eq!(failure.story.label(), "Button-slow");
        assert!(matches!(failure.error, DiffError::Timeout(_)));
        assert_eq!(failure.error.scope(), ErrorScope::Local);

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.status.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_posts_no_comment() {
        let story = StoryRef::new("Card", "wide");
        let image = RgbaImage::from_pixel(16, 16, WHITE);
        let capturer = Arc::new(StubCapturer::default().render(&story, &image, &with_red_block(&image)));

        let mut store = MockObjectStore::new();
        store
            .expect_put_public()
            .times(1)
            .returning(|_, _, _| Err(DiffError::Publish("403 Forbidden".to_string())));
        let poster = MockCommentPoster::new();

        let summary = pipeline(test_config(), Ok(vec![story]), capturer, Cancellation::new())
            .with_publisher(Publisher::new(Arc::new(store), Arc::new(poster)))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.differences, 1);
        assert!(matches!(summary.publish_error, Some(DiffError::Publish(_))));
        assert!(summary.report_location.is_none());
        assert_eq!(summary.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining_stories() {
        let stories = stories(&["a", "b", "c"]);
        let capturer = Arc::new(StubCapturer::default());
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let summary = pipeline(test_config(), Ok(stories), capturer.clone(), cancellation)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.compared, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(capturer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.status, RunStatus::Failed);
    }

    #[test]
    fn test_error_scopes() {
        assert_eq!(
            DiffError::capture("http://a", "net::ERR_FAILED").scope(),
            ErrorScope::Local
        );
        assert_eq!(
            DiffError::Comparison("x".to_string()).scope(),
            ErrorScope::Local
        );
        assert_eq!(
            DiffError::Publish("x".to_string()).scope(),
            ErrorScope::Deferred
        );
        assert!(DiffError::Startup("x".to_string()).is_fatal());
        assert!(DiffError::BrowserLaunch("x".to_string()).is_fatal());
    }

    #[test]
    fn test_browser_config_creation() {
        let config = Config::default();
        // no Chrome needed to build the launch configuration
        let _ = crate::create_browser_config(&config);
    }
}
