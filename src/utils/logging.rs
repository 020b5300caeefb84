use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Handle to the installed log filter.
///
/// Tracing starts before the config file is read, so the debug level from
/// `DebugLogs` is applied afterwards through this handle.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    pub fn set_debug(&self, debug: bool) {
        // RUST_LOG wins over the config flag
        if self.from_env {
            return;
        }
        if let Err(e) = self.filter.modify(|filter| *filter = default_filter(debug)) {
            tracing::warn!("Failed to change log level: {}", e);
        }
    }
}

fn default_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("info,fastdl_mirror=debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// keep the first subscriber.
pub fn init_tracing(debug: bool) -> LogHandle {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (default_filter(debug), false),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(debug),
        )
        .try_init();

    LogHandle {
        filter: handle,
        from_env,
    }
}
