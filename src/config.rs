//! Configuration management with serde serialization/deserialization
//!
//! Every recognized option of a run lives here: catalog origins, the emulated
//! device, browser launch settings, diff tolerances, composite layout, report
//! encoding, timeouts, the candidate build launcher and the publish targets.
//! Values come from a JSON file, then GitHub-Actions style environment
//! variables, then CLI flags.

use crate::error::{ConfigurationWarning, DiffError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for a diff run
///
/// # Examples
///
/// ```rust
/// use story_diff::Config;
///
/// let config = Config {
///     constant_url: Some("https://storybook.example.com/iframe.html".to_string()),
///     batch_size: 5,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Baseline catalog iframe URL; stories are also enumerated from here
    pub constant_url: Option<String>,

    /// Candidate catalog iframe URL
    pub variable_url: Option<String>,

    /// Stories per batch (default: 10)
    ///
    /// Batches run concurrently, stories inside a batch run one after another,
    /// so the number of batches is the peak number of in-flight comparisons.
    pub batch_size: usize,

    /// Emulated device used for every page scope
    pub device: DeviceProfile,

    /// Chrome launch settings
    pub browser: BrowserSettings,

    /// Image comparison parameters
    pub diff: DiffOptions,

    /// Layout of the three-panel composite
    pub composite: CompositeLayout,

    /// Final report encoding
    pub report: ReportOptions,

    pub timeouts: Timeouts,

    pub scroll: ScrollSettings,

    /// Candidate build / serve process
    pub launch: LaunchSettings,

    /// Upload and review comment targets
    pub publish: PublishSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            constant_url: None,
            variable_url: None,
            batch_size: 10,
            device: DeviceProfile::default(),
            browser: BrowserSettings::default(),
            diff: DiffOptions::default(),
            composite: CompositeLayout::default(),
            report: ReportOptions::default(),
            timeouts: Timeouts::default(),
            scroll: ScrollSettings::default(),
            launch: LaunchSettings::default(),
            publish: PublishSettings::default(),
        }
    }
}

/// Viewport plus user agent of the emulated device
///
/// Defaults to an iPhone 11 Pro profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub viewport: Viewport,
    pub user_agent: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 12_2 like Mac OS X) \
                         AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0 \
                         Mobile/15E148 Safari/604.1"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in CSS pixels (default: 375)
    pub width: u32,

    /// Viewport height in CSS pixels (default: 812)
    pub height: u32,

    /// Device pixel ratio (default: 3.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: true)
    pub mobile: bool,

    /// Whether touch events are emulated (default: true)
    pub has_touch: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 375,
            height: 812,
            device_scale_factor: 3.0,
            mobile: true,
            has_touch: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Path to Chrome/Chromium (default: per-OS install location, then auto-detect)
    pub chrome_path: Option<PathBuf>,

    /// Run without a visible window (default: true)
    pub headless: bool,

    /// Pass `--no-sandbox --disable-setuid-sandbox` (default: true, CI containers need it)
    pub no_sandbox: bool,

    /// Additional command-line switches appended verbatim
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            no_sandbox: true,
            extra_args: Vec::new(),
        }
    }
}

/// Parameters shared by the equality check and the highlighted diff
///
/// Both operations must see the same values, otherwise the highlight would
/// disagree with the verdict.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Maximum CIEDE2000 distance for two pixels to count as equal (default: 2.5)
    pub tolerance: f64,

    /// Brightness delta under which neighbours count as equal during
    /// anti-aliasing detection (default: 0)
    pub antialiasing_tolerance: f64,

    /// Ignore pixels classified as anti-aliasing (default: true)
    pub ignore_antialiasing: bool,

    /// Ignore a lone one-pixel vertical difference (default: true)
    pub ignore_caret: bool,

    /// Exact pixel comparison, disables every tolerance (default: false)
    pub strict: bool,

    /// Color painted over differing pixels (default: #ff00ff)
    pub highlight_color: HexColor,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            tolerance: 2.5,
            antialiasing_tolerance: 0.0,
            ignore_antialiasing: true,
            ignore_caret: true,
            strict: false,
            highlight_color: HexColor::rgb(0xff, 0x00, 0xff),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompositeLayout {
    /// Horizontal gap between panels, also the top offset of every panel (default: 100)
    pub gap: u32,

    /// Uniform margin around the composite (default: 40)
    pub margin: u32,

    /// Fill color behind the panels (default: transparent)
    pub background: HexColor,

    /// Draw the `kind-name` label into the top gap (default: true)
    pub draw_label: bool,

    pub label_color: HexColor,

    /// Integer upscale of the 8x8 label glyphs (default: 3)
    pub label_scale: u32,
}

impl Default for CompositeLayout {
    fn default() -> Self {
        Self {
            gap: 100,
            margin: 40,
            background: HexColor::rgba(0, 0, 0, 0),
            draw_label: true,
            label_color: HexColor::rgb(0, 0, 0),
            label_scale: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportOptions {
    /// Width the stacked report is downsampled to (default: 1024)
    pub output_width: u32,

    /// Sort artifacts by (kind, name) before stacking (default: false,
    /// completion order)
    pub sort_artifacts: bool,

    /// Also write the encoded report to this path
    pub report_path: Option<PathBuf>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            output_width: 1024,
            sort_artifacts: false,
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    /// Bound on one whole capture: navigation, idle wait, scroll, screenshot
    #[serde(with = "duration_ms")]
    pub navigation: Duration,

    /// Bound on story enumeration
    #[serde(with = "duration_ms")]
    pub enumeration: Duration,

    /// How long to wait for the network to go idle before capturing anyway
    #[serde(with = "duration_ms")]
    pub network_idle: Duration,

    /// Bound on the candidate server becoming reachable
    #[serde(with = "duration_ms")]
    pub startup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(30),
            enumeration: Duration::from_secs(60),
            network_idle: Duration::from_secs(10),
            startup: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrollSettings {
    pub step_px: u32,

    #[serde(with = "duration_ms")]
    pub delay: Duration,

    /// Upper bound for endlessly growing pages
    pub max_steps: u32,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            step_px: 100,
            delay: Duration::from_millis(100),
            max_steps: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// Shell command building the candidate catalog, run to completion
    pub build_command: Option<String>,

    /// Shell command serving the candidate catalog, kept alive for the run
    pub serve_command: Option<String>,

    /// `host:port` that must accept TCP connections before capturing
    pub wait_for_port: Option<String>,

    #[serde(with = "duration_ms")]
    pub port_poll_interval: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            build_command: None,
            serve_command: None,
            wait_for_port: None,
            port_poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishSettings {
    pub s3: S3Settings,
    pub github: GithubSettings,

    /// Commit the report is named after
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Path-style endpoint for S3-compatible stores
    pub endpoint: Option<String>,
}

impl S3Settings {
    pub fn is_complete(&self) -> bool {
        self.bucket.is_some()
            && self.region.is_some()
            && self.access_key_id.is_some()
            && self.secret_access_key.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GithubSettings {
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// `owner/repo`
    pub repository: Option<String>,

    pub pull_request: Option<u64>,

    pub api_url: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            token: None,
            repository: None,
            pull_request: None,
            api_url: "https://api.github.com".to_string(),
        }
    }
}

impl GithubSettings {
    pub fn is_complete(&self) -> bool {
        self.token.is_some() && self.repository.is_some() && self.pull_request.is_some()
    }
}

/// RGBA color written as `#rrggbb` or `#rrggbbaa`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(pub [u8; 4]);

impl HexColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 0xff])
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([r, g, b, a])
    }

    pub fn to_rgba(self) -> image::Rgba<u8> {
        image::Rgba(self.0)
    }
}

impl FromStr for HexColor {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        let invalid = || DiffError::Configuration(format!("invalid color '{s}'"));
        if !(hex.len() == 6 || hex.len() == 8) {
            return Err(invalid());
        }
        let bytes = hex::decode(hex).map_err(|_| invalid())?;
        let alpha = bytes.get(3).copied().unwrap_or(0xff);
        Ok(Self([bytes[0], bytes[1], bytes[2], alpha]))
    }
}

impl TryFrom<String> for HexColor {
    type Error = DiffError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HexColor> for String {
    fn from(color: HexColor) -> Self {
        color.to_string()
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        if a == 0xff {
            write!(f, "#{r:02x}{g:02x}{b:02x}")
        } else {
            write!(f, "#{r:02x}{g:02x}{b:02x}{a:02x}")
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Config {
    /// Overlay values from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Overlay values from an arbitrary environment lookup
    ///
    /// Recognizes the GitHub Actions input variables (`INPUT_*`) plus the
    /// `GITHUB_*` variables of the runner. The candidate origin is derived
    /// from `GITHUB_WORKSPACE` + `INPUT_STORYBOOK_IFRAME` as a `file://` URL
    /// unless `INPUT_VARIABLE_URL` is given.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("INPUT_CONSTANT_URL") {
            self.constant_url = Some(url);
        }

        if let Some(url) = lookup("INPUT_VARIABLE_URL") {
            self.variable_url = Some(url);
        } else if let Some(iframe) = lookup("INPUT_STORYBOOK_IFRAME") {
            let workspace = lookup("GITHUB_WORKSPACE").unwrap_or_default();
            self.variable_url = Some(format!("file://{workspace}{iframe}"));
        }

        if let Some(build) = lookup("INPUT_STORYBOOK_BUILD") {
            self.launch.build_command = Some(build);
        }

        let s3 = &mut self.publish.s3;
        if let Some(v) = lookup("INPUT_S3_ACCESS_TOKEN") {
            s3.access_key_id = Some(v);
        }
        if let Some(v) = lookup("INPUT_S3_SECRET_TOKEN") {
            s3.secret_access_key = Some(v);
        }
        if let Some(v) = lookup("INPUT_S3_BUCKET") {
            s3.bucket = Some(v);
        }
        if let Some(v) = lookup("INPUT_S3_REGION") {
            s3.region = Some(v);
        }

        let github = &mut self.publish.github;
        if let Some(v) = lookup("INPUT_GITHUB_TOKEN") {
            github.token = Some(v);
        }
        if let Some(v) = lookup("GITHUB_REPOSITORY") {
            github.repository = Some(v);
        }
        if let Some(v) = lookup("GITHUB_API_URL") {
            github.api_url = v;
        }

        if let Some(sha) = lookup("GITHUB_SHA") {
            self.publish.commit_sha = Some(sha);
        }
    }

    /// Check the configuration
    ///
    /// Returns the non-fatal warnings (missing origins, incomplete publish
    /// targets) or a configuration error for values that cannot work.
    pub fn validate(&self) -> Result<Vec<ConfigurationWarning>, DiffError> {
        if self.batch_size == 0 {
            return Err(DiffError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.device.viewport.width == 0 || self.device.viewport.height == 0 {
            return Err(DiffError::Configuration(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }
        if !(self.device.viewport.device_scale_factor > 0.0) {
            return Err(DiffError::Configuration(
                "device_scale_factor must be positive".to_string(),
            ));
        }
        if !self.diff.tolerance.is_finite() || self.diff.tolerance < 0.0 {
            return Err(DiffError::Configuration(
                "diff tolerance must be a non-negative number".to_string(),
            ));
        }
        if !self.diff.antialiasing_tolerance.is_finite() || self.diff.antialiasing_tolerance < 0.0 {
            return Err(DiffError::Configuration(
                "antialiasing tolerance must be a non-negative number".to_string(),
            ));
        }
        if self.report.output_width == 0 {
            return Err(DiffError::Configuration(
                "report output_width must be greater than 0".to_string(),
            ));
        }
        if self.scroll.step_px == 0 {
            return Err(DiffError::Configuration(
                "scroll step must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.navigation.is_zero() || self.timeouts.enumeration.is_zero() {
            return Err(DiffError::Configuration(
                "navigation and enumeration timeouts must be greater than 0".to_string(),
            ));
        }
        if self.launch.wait_for_port.is_some() && self.launch.port_poll_interval.is_zero() {
            return Err(DiffError::Configuration(
                "port_poll_interval must be greater than 0 when waiting for a port".to_string(),
            ));
        }

        let mut warnings = Vec::new();

        for (field, value) in [
            ("constant_url", &self.constant_url),
            ("variable_url", &self.variable_url),
        ] {
            match value {
                None => warnings.push(ConfigurationWarning::new(field, "not set")),
                Some(url) if crate::utils::validate_origin(url).is_err() => warnings.push(
                    ConfigurationWarning::new(field, format!("'{url}' is not a valid URL")),
                ),
                Some(_) => {}
            }
        }

        if self.publish.github.token.is_none() {
            warnings.push(ConfigurationWarning::new("github.token", "not set"));
        }
        if !self.publish.github.is_complete() {
            warnings.push(ConfigurationWarning::new(
                "publish.github",
                "token, repository or pull request missing; comment will be skipped",
            ));
        }
        if !self.publish.s3.is_complete() {
            warnings.push(ConfigurationWarning::new(
                "publish.s3",
                "bucket, region or credentials missing; upload will be skipped",
            ));
        }
        if self.launch.serve_command.is_some() && self.launch.wait_for_port.is_none() {
            warnings.push(ConfigurationWarning::new(
                "launch.wait_for_port",
                "serve_command is set without a port to wait for",
            ));
        }

        Ok(warnings)
    }

    pub fn publish_enabled(&self) -> bool {
        self.publish.s3.is_complete() && self.publish.github.is_complete()
    }
}

/// Pull request number from a GitHub event payload
pub fn pull_request_from_event(event: &serde_json::Value) -> Option<u64> {
    event
        .get("pull_request")
        .and_then(|pr| pr.get("number"))
        .and_then(serde_json::Value::as_u64)
}

/// Well-known Chrome install location for the host OS
///
/// An explicitly configured path always wins. When the default location does
/// not exist `None` is returned and chromiumoxide falls back to its own
/// detection.
pub fn resolve_chrome_path(settings: &BrowserSettings) -> Option<PathBuf> {
    if let Some(path) = &settings.chrome_path {
        return Some(path.clone());
    }

    let candidate = if cfg!(target_os = "windows") {
        let program_files = if cfg!(target_arch = "x86_64") {
            std::env::var("PROGRAMFILES(X86)").ok()
        } else {
            std::env::var("PROGRAMFILES").ok()
        }?;
        PathBuf::from(program_files).join("Google/Chrome/Application/chrome.exe")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
    } else {
        PathBuf::from("/usr/bin/google-chrome")
    };

    candidate.exists().then_some(candidate)
}

/// Chrome command-line switches for the configured device and sandbox policy
///
/// # Examples
///
/// ```rust
/// use story_diff::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default());
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--hide-scrollbars".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--no-first-run".to_string(),
        // the candidate is usually served from file://
        "--allow-file-access-from-files".to_string(),
        format!(
            "--window-size={},{}",
            config.device.viewport.width, config.device.viewport.height
        ),
        format!("--user-agent={}", config.device.user_agent),
    ];

    if config.browser.no_sandbox {
        args.push("--no-sandbox".to_string());
        args.push("--disable-setuid-sandbox".to_string());
    }

    args.extend(config.browser.extra_args.iter().cloned());
    args
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, DiffError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.device.viewport.width, config.device.viewport.height)
        .args(get_chrome_args(config));

    if !config.browser.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = resolve_chrome_path(&config.browser) {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(DiffError::BrowserLaunch)
}
