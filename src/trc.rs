//! Tracing configuration and initialization.
//!
//! The subscriber is built with a [`reload::Layer`] wrapping the fmt
//! layer so the output format can be switched at runtime, e.g. from the
//! compact interactive format to plain machine-readable logging when the
//! process daemonizes.

use tracing_subscriber::{
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    reload,
    util::{SubscriberInitExt as _, TryInitError},
    EnvFilter, Registry,
};

use crate::term;

/// The type-erased fmt layer that lives inside the reload handle.
type BoxedFmtLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>;

/// The reload handle type used to swap the fmt layer at runtime.
type FmtReloadHandle = reload::Handle<BoxedFmtLayer, Registry>;

/// Output format of the subscriber.
enum TrcMode {
    /// Compact, colorful, no timestamps: for a human at a terminal.
    Pretty { use_ansi: bool },
    /// Verbose machine-readable logging with span events.
    Plain { use_ansi: bool },
}

impl TrcMode {
    fn layer(&self) -> BoxedFmtLayer {
        match self {
            Self::Pretty { use_ansi } => Box::new(
                tracing_subscriber::fmt::layer()
                    .with_ansi(*use_ansi)
                    .with_target(false)
                    .without_time()
                    .compact(),
            ),
            Self::Plain { use_ansi } => Box::new(
                tracing_subscriber::fmt::layer()
                    .with_ansi(*use_ansi)
                    .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE),
            ),
        }
    }
}

/// A handle that allows reconfiguring the subscriber at runtime.
pub struct TrcHandle {
    fmt_handle: FmtReloadHandle,
}

impl TrcHandle {
    fn reconfigure(&self, mode: &TrcMode) {
        if let Err(e) = self.fmt_handle.reload(mode.layer()) {
            eprintln!("Failed to reconfigure tracing: {e}");
        }
    }

    /// Switch to plain logging, as wanted after daemonizing.
    pub fn reconfigure_for_daemon(&self, use_ansi: bool) {
        self.reconfigure(&TrcMode::Plain { use_ansi });
    }
}

/// Builder for the tracing subscriber.
pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let use_ansi = term::should_use_color(&std::io::stderr());
        let maybe_env_filter =
            EnvFilter::try_from_env("NFS_FS_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // A user who set a filter wants the full, greppable output.
            Ok(env_filter) => Self {
                mode: TrcMode::Plain { use_ansi },
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Pretty { use_ansi },
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Initialize the global subscriber and return a handle for runtime
    /// reconfiguration.
    pub fn init(self) -> Result<TrcHandle, TryInitError> {
        let (reload_layer, fmt_handle) = reload::Layer::new(self.mode.layer());

        tracing_subscriber::registry()
            .with(reload_layer)
            .with(self.env_filter)
            .try_init()?;

        Ok(TrcHandle { fmt_handle })
    }
}
