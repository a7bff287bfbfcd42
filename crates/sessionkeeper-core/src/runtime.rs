//! The session runtime: every session component for one tab, wired together
//! and owned by the application root.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{
    ApiError, ApiRequest, ApiResponse, IdentityClient, RefreshCoordinator, RequestPipeline,
    Transport,
};
use crate::auth::{CredentialStore, SessionState};
use crate::config::Config;
use crate::events::{CrossTabChannel, EventBus};
use crate::session::controller::ControllerParts;
use crate::session::health::HealthMonitor;
use crate::session::{Navigator, Notifier, SessionController};
use crate::storage::{Storage, TabStorage};

/// What the host application provides to a runtime.
pub struct HostBindings {
    pub transport: Arc<dyn Transport>,
    /// This tab's view of origin-wide durable storage.
    pub durable: TabStorage,
    /// Storage that lives and dies with this tab.
    pub ephemeral: Arc<dyn Storage>,
    pub notifier: Arc<dyn Notifier>,
    pub navigator: Arc<dyn Navigator>,
}

struct Tasks {
    listener: JoinHandle<()>,
    health: Option<HealthMonitor>,
}

pub struct SessionRuntime {
    config: Config,
    bus: Arc<EventBus>,
    credentials: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
    pipeline: Arc<RequestPipeline>,
    cross_tab: CrossTabChannel,
    controller: SessionController,
    tasks: Mutex<Option<Tasks>>,
}

impl SessionRuntime {
    pub fn new(config: Config, host: HostBindings) -> Self {
        let bus = Arc::new(EventBus::new());
        let durable: Arc<dyn Storage> = Arc::new(host.durable.clone());
        let credentials = Arc::new(CredentialStore::new(durable, host.ephemeral));
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&host.transport),
            Arc::clone(&credentials),
            Arc::clone(&bus),
            config.cookie_auth,
            config.timings.access_token_ttl(),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&host.transport),
            Arc::clone(&credentials),
            Arc::clone(&refresh),
            Arc::clone(&bus),
            &config,
        ));
        let cross_tab = CrossTabChannel::new(host.durable, config.timings.cross_tab_clear_delay());
        let controller = SessionController::new(ControllerParts {
            config: config.clone(),
            credentials: Arc::clone(&credentials),
            refresh: Arc::clone(&refresh),
            identity: IdentityClient::new(host.transport, Arc::clone(&pipeline)),
            bus: Arc::clone(&bus),
            cross_tab: cross_tab.clone(),
            notifier: host.notifier,
            navigator: host.navigator,
        });

        Self {
            config,
            bus,
            credentials,
            refresh,
            pipeline,
            cross_tab,
            controller,
            tasks: Mutex::new(None),
        }
    }

    /// Start listening to the bus and other tabs, then validate the session.
    pub async fn init(&self) -> SessionState {
        {
            let mut tasks = lock(&self.tasks);
            if tasks.is_none() {
                self.controller.attach();
                let period = self.config.timings.health_check_interval();
                *tasks = Some(Tasks {
                    listener: self.cross_tab.listen(Arc::clone(&self.bus)),
                    health: (!period.is_zero())
                        .then(|| HealthMonitor::spawn(self.controller.clone(), period)),
                });
                debug!("Session runtime started");
            }
        }
        let state = self.controller.check_auth().await;
        info!(?state, "Session initialized");
        state
    }

    /// Stop background work and detach from the bus. Idempotent.
    pub fn dispose(&self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.listener.abort();
            if let Some(health) = tasks.health {
                health.stop();
            }
            self.controller.detach();
            debug!("Session runtime disposed");
        }
    }

    /// Call the API with credential handling and refresh-and-retry.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.pipeline.send(request).await
    }

    /// The host regained (or lost) visibility or focus.
    pub fn on_visibility_change(&self, visible: bool) {
        if !visible {
            return;
        }
        if let Some(health) = lock(&self.tasks).as_ref().and_then(|t| t.health.as_ref()) {
            health.wake();
        }
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
