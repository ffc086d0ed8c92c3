//! Plugin registry: initialize-once with rollback, deterministic shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::interceptor::{Guarded, Interceptor};
use crate::client::options::Options;
use crate::error::{Error, Result};

/// A component that contributes interceptors and receives lifecycle calls.
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called once at registration. Interceptors contributed through the
    /// context are rolled back atomically if this returns an error.
    fn initialize(&self, ctx: &mut PluginContext<'_>) -> Result<()>;

    /// Called at unregistration, off the caller's thread, under the
    /// configured timeout. Blocking here is acceptable.
    fn shutdown(&self) {}
}

/// Hands a plugin its registration surface.
pub struct PluginContext<'a> {
    options: &'a Options,
    staged: Vec<Arc<dyn Interceptor>>,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(options: &'a Options) -> PluginContext<'a> {
        PluginContext {
            options,
            staged: Vec::new(),
        }
    }

    /// Contributes an interceptor; committed only if `initialize` succeeds.
    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.staged.push(interceptor);
    }

    /// A cloned view of the live options; mutating it changes nothing.
    pub fn options_snapshot(&self) -> Options {
        self.options.clone()
    }

    pub(crate) fn into_staged(self) -> Vec<Arc<dyn Interceptor>> {
        self.staged
    }
}

pub(crate) struct PluginEntry {
    pub(crate) plugin: Arc<dyn Plugin>,
    /// Names of the interceptors this plugin contributed, for removal.
    pub(crate) contributed: Vec<String>,
}

/// Registers a plugin, returning the guards to append on success.
pub(crate) fn initialize_plugin(
    plugin: &Arc<dyn Plugin>,
    options: &Options,
) -> Result<(PluginEntry, Vec<Guarded>)> {
    let mut ctx = PluginContext::new(options);
    plugin.initialize(&mut ctx)?;
    let staged = ctx.into_staged();
    let contributed = staged.iter().map(|i| i.name().to_owned()).collect();
    let guards = staged.into_iter().map(Guarded::new).collect();
    debug!("plugin {} initialized", plugin.name());
    Ok((
        PluginEntry {
            plugin: plugin.clone(),
            contributed,
        },
        guards,
    ))
}

/// Runs `shutdown` on the blocking pool under a timeout. The plugin is
/// removed whether or not the deadline held; a miss is surfaced as an error.
pub(crate) async fn shutdown_plugin(plugin: Arc<dyn Plugin>, timeout: Duration) -> Result<()> {
    let name = plugin.name().to_owned();
    // Dispatched off the calling thread so a shutdown that posts back to
    // the caller cannot deadlock it.
    let join = tokio::task::spawn_blocking(move || plugin.shutdown());
    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(join_err)) => Err(Error::new_unknown(format!(
            "plugin {} shutdown panicked: {}",
            name, join_err
        ))),
        Err(_) => {
            warn!("plugin {} shutdown exceeded {:?}", name, timeout);
            Err(Error::new_timeout())
        }
    }
}
