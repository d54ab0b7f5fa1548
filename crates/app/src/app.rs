use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing_subscriber::{
    Layer, filter::LevelFilter, filter::filter_fn, fmt, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const LOG_MAIN: &str = "main";

/// Application infrastructure context.
///
/// Holds version info and the logging infrastructure. Every binary of the
/// workspace needs one, whether it drives a Bevy `App` or not.
pub struct AppContext {
    app_id: &'static str,
    version: &'static str,
    log_file: PathBuf,
    /// The log guard must be kept alive for the duration of the application
    /// to ensure log messages are properly flushed.
    _log_guard: tracing_appender::non_blocking::WorkerGuard,
}

impl AppContext {
    pub fn app_id(&self) -> &str {
        self.app_id
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Path of the log file written by this process.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }
}

/// Application metadata trait.
///
/// Define your application's identity by implementing this trait.
pub trait Application: Sized + 'static {
    const APP_ID: &'static str;
    const STUDIO: &'static str = "chicken105";
}

/// Builder for creating applications with logging in place.
///
/// Use this to create either simple applications (just `AppContext`)
/// or Bevy-based applications (`BevyApp<A>`).
pub struct AppBuilder<A: Application> {
    context: AppContext,
    _marker: PhantomData<A>,
}

impl<A: Application> AppBuilder<A> {
    /// Create a new application builder.
    ///
    /// This performs all the common initialization:
    /// - Ensures the log directory exists
    /// - Initializes logging (file + console)
    pub fn new(version: &'static str, log_dir: impl Into<PathBuf>) -> Result<Self, BoxError> {
        let log_dir = log_dir.into();
        let log_filename = log_file_name(A::APP_ID, chrono::Local::now());
        let log_file = prepare_log_file(&log_dir, &log_filename)?;

        let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let level = default_level();

        // Separate layer: file (non-blocking) + console (stdout)
        let file_layer = fmt::Layer::default()
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking)
            .with_filter(filter_fn(move |metadata| metadata.level() <= &level));

        let console_layer = fmt::Layer::default()
            .with_target(true)
            .with_filter(filter_fn(move |metadata| metadata.level() <= &level));

        tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .try_init()?;

        tracing::info!(target: LOG_MAIN, "{} {} logging to {:?}", A::APP_ID, version, log_file);

        Ok(Self {
            context: AppContext {
                app_id: A::APP_ID,
                version,
                log_file,
                _log_guard: guard,
            },
            _marker: PhantomData,
        })
    }

    /// Build a simple application (no Bevy).
    pub fn build_simple(self) -> AppContext {
        self.context
    }

    /// Build a Bevy-based application.
    ///
    /// The `configure` callback receives the Bevy `App` by value and the `AppContext`,
    /// and must return the configured App. This follows Bevy's builder pattern.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let app = AppBuilder::<MyApp>::new("1.0.0", "logs")?
    ///     .build_with_bevy(|mut app, _ctx| {
    ///         app.add_plugins(MinigamePlugin::default());
    ///         app
    ///     });
    /// ```
    #[cfg(feature = "bevy")]
    pub fn build_with_bevy(
        self,
        configure: impl FnOnce(bevy::prelude::App, &AppContext) -> bevy::prelude::App,
    ) -> BevyApp<A> {
        let bevy_app = bevy::prelude::App::new();
        let configured_app = configure(bevy_app, &self.context);

        BevyApp {
            context: self.context,
            app: configured_app,
            _marker: PhantomData,
        }
    }
}

/// Bevy-based application wrapper.
///
/// Contains both the infrastructure context and the Bevy App.
/// The context is kept alive to ensure logging continues working.
#[cfg(feature = "bevy")]
pub struct BevyApp<A: Application> {
    pub context: AppContext,
    pub app: bevy::prelude::App,
    _marker: PhantomData<A>,
}

#[cfg(feature = "bevy")]
impl<A: Application> BevyApp<A> {
    /// Advance the Bevy application by one frame.
    pub fn update(&mut self) {
        self.app.update();
    }

    /// Get a reference to the app context.
    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Get a mutable reference to the Bevy app.
    pub fn app_mut(&mut self) -> &mut bevy::prelude::App {
        &mut self.app
    }
}

/// File name for a log started at `at`: `<app_id>.<YYYYmmdd-HHMMSS>.log`.
pub fn log_file_name(app_id: &str, at: chrono::DateTime<chrono::Local>) -> String {
    format!("{}.{}.log", app_id, at.format("%Y%m%d-%H%M%S"))
}

/// Creates `log_dir` if needed and returns the path of `file_name` inside it.
pub fn prepare_log_file(log_dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    Ok(log_dir.join(file_name))
}

/// Per-application log directory below `base`: `<studio>/<app_id>/logs`.
pub fn log_dir_in<A: Application>(base: &Path) -> PathBuf {
    base.join(A::STUDIO).join(A::APP_ID).join("logs")
}

/// Default log directory for an application.
///
/// Debug builds log into the workspace `.out/` folder, release builds into the
/// platform local data directory (temp directory if the platform has none).
pub fn default_log_dir<A: Application>() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join(".out")
            .join(A::APP_ID)
            .join("logs")
    }
    #[cfg(not(debug_assertions))]
    {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        log_dir_in::<A>(&base)
    }
}

#[cfg(debug_assertions)]
fn default_level() -> LevelFilter {
    LevelFilter::INFO
}

#[cfg(not(debug_assertions))]
fn default_level() -> LevelFilter {
    LevelFilter::WARN
}
