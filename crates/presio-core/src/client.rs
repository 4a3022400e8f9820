//! The presence engine.
//!
//! [`PresenceClient`] owns every piece of live session state: the
//! placeholder registry, the expression adapter, the asset index and icon
//! cache, the connection state machine with its bounded retry loop, the
//! current compiled presence, and the join-request gate. One instance is
//! constructed per session; there are no globals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use presio_protocol::{limits, Activity, ActivityButton, PartyPrivacy, User};
use presio_transport::{EventKind, Transport, TransportError, TransportEvent};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::assets::{AssetIndex, AssetKind, IconResolver};
use crate::funcs;
use crate::join::JoinGate;
use crate::presence::CompiledPresence;
use crate::registry::Registry;
use crate::script::{format_words, Scripts};
use crate::template::PresenceTemplate;
use crate::value::{Producer, Value};

/// Logical connection state.
///
/// `Closed` and `Invalid` are terminal except for an explicit
/// [`PresenceClient::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Closed,
    Disconnected,
    Ready,
    JoinRequest,
    JoinGame,
    SpectateGame,
    Invalid,
}

impl Status {
    /// Whether the session can carry presence operations.
    #[must_use]
    pub fn is_available(self) -> bool {
        !matches!(self, Status::Closed | Status::Disconnected | Status::Invalid)
    }
}

/// The active party session attached to outgoing payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartySession {
    pub id: String,
    pub size: u32,
    pub max: u32,
    pub privacy: PartyPrivacy,
    pub join_secret: String,
    pub match_secret: String,
    pub spectate_secret: String,
}

impl PartySession {
    /// Whether any multiplayer secret is set.
    ///
    /// A set secret takes visual precedence over buttons on the wire.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        !self.join_secret.is_empty()
            || !self.match_secret.is_empty()
            || !self.spectate_secret.is_empty()
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application id used during the transport handshake.
    pub client_id: String,
    /// Connect attempts per retry loop before giving up.
    pub max_connection_attempts: u32,
    /// Transmit structurally identical payloads anyway.
    pub allow_duplicate_activities: bool,
    /// Word-casing passes applied to text fields; zero disables.
    pub word_format_passes: u32,
    /// Icon the resolver degrades to when a chain is exhausted.
    pub default_icon: String,
    /// Join-request response window, in ticks.
    pub join_timeout_ticks: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            max_connection_attempts: 10,
            allow_duplicate_activities: false,
            word_format_passes: 1,
            default_icon: "default".to_string(),
            join_timeout_ticks: crate::join::DEFAULT_TIMEOUT_TICKS,
        }
    }
}

type JoinRequestCallback = Arc<dyn Fn(&User) + Send + Sync>;
type SecretCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The presence engine. Construct one per session via [`PresenceClient::new`].
pub struct PresenceClient {
    config: ClientConfig,
    registry: Arc<Registry>,
    scripts: Scripts,
    assets: Arc<AssetIndex>,
    icons: Arc<IconResolver>,
    transport: Arc<dyn Transport>,

    status: Mutex<Status>,
    current_user: Mutex<Option<User>>,
    current_presence: Mutex<Option<CompiledPresence>>,
    // Outer Option: nothing transmitted yet. Inner: a clear is a payload too.
    last_payload: Mutex<Option<Option<Activity>>>,
    party: Mutex<PartySession>,
    join_gate: Mutex<JoinGate>,

    retry_in_flight: AtomicBool,
    retry_task: Mutex<Option<JoinHandle<()>>>,

    default_template: Mutex<PresenceTemplate>,
    forced_templates: Mutex<BTreeMap<String, PresenceTemplate>>,
    custom_variables: Mutex<BTreeMap<String, String>>,

    on_join_request: Mutex<Option<JoinRequestCallback>>,
    on_join_secret: Mutex<Option<SecretCallback>>,
    on_spectate_secret: Mutex<Option<SecretCallback>>,
}

impl PresenceClient {
    /// Build an engine over the given transport.
    ///
    /// The registry starts with the stdlib function library installed.
    #[must_use]
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_decompile_sink(config, transport, None)
    }

    /// Build an engine with an optional decompilation sink attached to
    /// the expression adapter.
    #[must_use]
    pub fn with_decompile_sink(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        sink: Option<Arc<Mutex<String>>>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let assets = Arc::new(AssetIndex::new());
        funcs::install_stdlib(&registry, Arc::clone(&assets));

        let mut scripts = Scripts::new(Arc::clone(&registry));
        if let Some(sink) = sink {
            scripts = scripts.with_sink(sink);
        }
        let icons = Arc::new(IconResolver::new(
            Arc::clone(&assets),
            config.default_icon.clone(),
        ));
        let join_gate = JoinGate::new(config.join_timeout_ticks);

        Arc::new(Self {
            config,
            registry,
            scripts,
            assets,
            icons,
            transport,
            status: Mutex::new(Status::Closed),
            current_user: Mutex::new(None),
            current_presence: Mutex::new(None),
            last_payload: Mutex::new(None),
            party: Mutex::new(PartySession::default()),
            join_gate: Mutex::new(join_gate),
            retry_in_flight: AtomicBool::new(false),
            retry_task: Mutex::new(None),
            default_template: Mutex::new(PresenceTemplate::default()),
            forced_templates: Mutex::new(BTreeMap::new()),
            custom_variables: Mutex::new(BTreeMap::new()),
            on_join_request: Mutex::new(None),
            on_join_secret: Mutex::new(None),
            on_spectate_secret: Mutex::new(None),
        })
    }

    /// Leave the terminal `Closed`/`Invalid` states and allow connecting.
    pub fn init(&self) {
        self.set_status(Status::Disconnected);
    }

    /// The current logical connection state.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, status: Status) {
        let mut guard = self.status.lock().expect("status lock poisoned");
        if *guard != status {
            debug!(from = ?*guard, to = ?status, "Connection state changed");
            *guard = status;
        }
    }

    /// Whether the session can carry presence operations.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status().is_available()
    }

    /// Live transport connectivity, independent of the logical state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether the session is terminally closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    /// The placeholder registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The expression adapter.
    #[must_use]
    pub fn scripts(&self) -> &Scripts {
        &self.scripts
    }

    /// The asset index.
    #[must_use]
    pub fn assets(&self) -> &Arc<AssetIndex> {
        &self.assets
    }

    /// The memoized icon resolver; its cache is cleared on shutdown.
    #[must_use]
    pub fn icon_resolver(&self) -> &Arc<IconResolver> {
        &self.icons
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The user identified during the last handshake, if any.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.current_user
            .lock()
            .expect("user lock poisoned")
            .clone()
    }

    /// The most recent primary compiled presence, if any.
    #[must_use]
    pub fn current_presence(&self) -> Option<CompiledPresence> {
        self.current_presence
            .lock()
            .expect("presence lock poisoned")
            .clone()
    }

    /// Snapshot of the active party session.
    #[must_use]
    pub fn party(&self) -> PartySession {
        self.party.lock().expect("party lock poisoned").clone()
    }

    /// Replace the active party session.
    pub fn set_party(&self, session: PartySession) {
        *self.party.lock().expect("party lock poisoned") = session;
    }

    /// Callback invoked when a join request opens a prompt.
    pub fn on_join_request(&self, callback: impl Fn(&User) + Send + Sync + 'static) {
        *self
            .on_join_request
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Callback invoked with the join secret when the local user joins.
    pub fn on_join_secret(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self
            .on_join_secret
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Callback invoked with the spectate secret.
    pub fn on_spectate_secret(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self
            .on_spectate_secret
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    // ---- registry sync -------------------------------------------------

    /// Install a fixed value placeholder.
    pub fn sync_argument(&self, path: &str, value: Value) {
        self.registry.set_value(path, value);
    }

    /// Install a lazily-evaluated placeholder.
    pub fn sync_producer(&self, path: &str, producer: Producer) {
        self.registry.set(path, producer);
    }

    /// Record the current time (Unix seconds) under a path.
    pub fn sync_timestamp(&self, path: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.registry.set_value(path, Value::from(now));
    }

    /// Diff-sync user variables under the `custom.` namespace.
    ///
    /// Entries absent from `variables` are removed; added or changed
    /// entries are installed.
    pub fn sync_dynamic_variables(&self, variables: BTreeMap<String, String>) {
        let mut current = self
            .custom_variables
            .lock()
            .expect("custom variables lock poisoned");
        for stale in current.keys() {
            if !variables.contains_key(stale) {
                self.registry.remove(&format!("custom.{stale}"));
            }
        }
        for (name, value) in &variables {
            if current.get(name) != Some(value) {
                self.registry
                    .set_value(&format!("custom.{name}"), Value::from(value.clone()));
            }
        }
        *current = variables;
    }

    // ---- templates -----------------------------------------------------

    /// Replace the default template.
    pub fn set_default_template(&self, template: PresenceTemplate) {
        *self
            .default_template
            .lock()
            .expect("template lock poisoned") = template;
    }

    /// Install or replace a forced-override template.
    pub fn set_forced_template(&self, id: impl Into<String>, template: PresenceTemplate) {
        self.forced_templates
            .lock()
            .expect("template lock poisoned")
            .insert(id.into(), template);
    }

    /// Remove a forced-override template.
    pub fn clear_forced_template(&self, id: &str) {
        self.forced_templates
            .lock()
            .expect("template lock poisoned")
            .remove(id);
    }

    /// Selection policy: first enabled forced override marked as main,
    /// else the default template.
    #[must_use]
    pub fn select_template(&self) -> PresenceTemplate {
        let forced = self
            .forced_templates
            .lock()
            .expect("template lock poisoned");
        forced
            .values()
            .find(|template| template.enabled && template.use_as_main)
            .cloned()
            .unwrap_or_else(|| {
                self.default_template
                    .lock()
                    .expect("template lock poisoned")
                    .clone()
            })
    }

    /// Resolve an override target against the last enabled, non-main
    /// forced template, for preview tooling.
    #[must_use]
    pub fn override_text(&self, target: &str) -> Option<String> {
        let forced = self
            .forced_templates
            .lock()
            .expect("template lock poisoned");
        forced
            .values()
            .rev()
            .filter(|template| template.enabled && !template.use_as_main)
            .find_map(|template| template.field_by_name(target).map(str::to_string))
    }

    /// Resolve an icon through the memoized fallback chain.
    #[must_use]
    pub fn resolve_icon(&self, allow_null: bool, log_enabled: bool, candidates: &[&str]) -> String {
        self.icons.resolve(allow_null, log_enabled, candidates)
    }

    // ---- compilation ---------------------------------------------------

    /// Compile a template into a presence snapshot.
    ///
    /// With `as_primary`, the session must be available and connected
    /// with no reconnect loop in flight; otherwise the cycle is skipped
    /// with `None`. A primary compile replaces the current presence,
    /// re-sanitizes the party session in place, and returns a wire
    /// payload alongside the snapshot.
    #[must_use]
    pub fn compile_presence(
        &self,
        template: &PresenceTemplate,
        as_primary: bool,
    ) -> Option<(CompiledPresence, Option<Activity>)> {
        if as_primary
            && (!self.is_available()
                || !self.is_connected()
                || self.retry_in_flight.load(Ordering::SeqCst))
        {
            trace!("Skipping primary compile, session not ready");
            return None;
        }

        let details = self.eval_text(&template.details, "details", limits::MAX_LINE_BYTES, true);
        let state = self.eval_text(&template.state, "state", limits::MAX_LINE_BYTES, true);

        let (raw_large, large_image) =
            self.resolve_image(&template.large_image_key, "large_image_key");
        let (raw_small, small_image) =
            self.resolve_image(&template.small_image_key, "small_image_key");
        let large_text = self.eval_text(
            &template.large_image_text,
            "large_image_text",
            limits::MAX_IMAGE_TEXT_BYTES,
            true,
        );
        let small_text = self.eval_text(
            &template.small_image_text,
            "small_image_text",
            limits::MAX_IMAGE_TEXT_BYTES,
            true,
        );

        // Start parse failure zeroes both timestamps; end parses
        // independently and defaults to zero.
        let start_text = self
            .scripts
            .get_result(&template.start_timestamp, "start_timestamp", &[]);
        let (start, end) = match start_text.trim().parse::<i64>() {
            Ok(start) => {
                let end = self
                    .scripts
                    .get_result(&template.end_timestamp, "end_timestamp", &[])
                    .trim()
                    .parse::<i64>()
                    .unwrap_or(0);
                (start, end)
            }
            Err(_) => (0, 0),
        };

        let suppress_buttons =
            as_primary && self.party.lock().expect("party lock poisoned").has_secret();
        let mut buttons = Vec::new();
        if !suppress_buttons {
            for (id, button) in &template.buttons {
                if id == "default" || button.label.trim().is_empty() {
                    continue;
                }
                let label = self.eval_text(
                    &button.label,
                    &format!("{id}.label"),
                    limits::MAX_BUTTON_LABEL_BYTES,
                    true,
                );
                let url = self.eval_text(
                    &button.url,
                    &format!("{id}.url"),
                    limits::MAX_BUTTON_URL_BYTES,
                    false,
                );
                if !label.is_empty() && !url.is_empty() {
                    buttons.push(ActivityButton::new(label, url));
                }
            }
        }

        let compiled = CompiledPresence {
            details,
            state,
            raw_large_image: raw_large,
            raw_small_image: raw_small,
            large_image,
            small_image,
            large_image_text: large_text,
            small_image_text: small_text,
            start_timestamp: start,
            end_timestamp: end,
            buttons,
        };

        if !as_primary {
            return Some((compiled, None));
        }

        // Keep displayed and transmitted party state consistent.
        let party = {
            let mut party = self.party.lock().expect("party lock poisoned");
            party.id = limits::sanitize_or_empty(&party.id, limits::MAX_PARTY_ID_BYTES);
            party.join_secret =
                limits::sanitize_or_empty(&party.join_secret, limits::MAX_SECRET_BYTES);
            party.match_secret =
                limits::sanitize_or_empty(&party.match_secret, limits::MAX_SECRET_BYTES);
            party.spectate_secret =
                limits::sanitize_or_empty(&party.spectate_secret, limits::MAX_SECRET_BYTES);
            party.clone()
        };

        let mut activity = Activity::new()
            .with_details(compiled.details.clone())
            .with_state(compiled.state.clone())
            .with_timestamps(compiled.start_timestamp, compiled.end_timestamp)
            .with_large_image(
                compiled.large_image.clone(),
                compiled.large_image_text.clone(),
            )
            .with_small_image(
                compiled.small_image.clone(),
                compiled.small_image_text.clone(),
            )
            .with_party(party.id.clone(), party.size, party.max, party.privacy)
            .with_secrets(
                party.join_secret.clone(),
                party.match_secret.clone(),
                party.spectate_secret.clone(),
            );
        for button in &compiled.buttons {
            activity = activity.with_button(button.clone());
        }

        *self
            .current_presence
            .lock()
            .expect("presence lock poisoned") = Some(compiled.clone());

        Some((compiled, Some(activity)))
    }

    fn eval_text(&self, text: &str, target: &str, max_bytes: usize, word_case: bool) -> String {
        let raw = self.scripts.get_result(text, target, &[]);
        let cased = if word_case && self.config.word_format_passes > 0 {
            format_words(&raw, self.config.word_format_passes)
        } else {
            raw
        };
        limits::sanitize_or_empty(&cased, max_bytes)
    }

    fn resolve_image(&self, text: &str, target: &str) -> (String, String) {
        let raw = self.scripts.get_result(text, target, &[]);
        let resolved = match self.assets.get(&raw) {
            Some(asset) => match asset.kind {
                // Custom asset URLs are themselves expressions, enabling
                // per-session dynamic images.
                AssetKind::Custom => self
                    .scripts
                    .get_result(&asset.url.unwrap_or_default(), target, &[]),
                AssetKind::Canonical => asset.name,
            },
            // Unresolved keys pass through unchanged.
            None => raw.clone(),
        };
        (raw, limits::sanitize_or_empty(&resolved, limits::MAX_IMAGE_KEY_BYTES))
    }

    /// Compile the selected template as primary and transmit it.
    pub async fn update(self: &Arc<Self>) {
        let template = self.select_template();
        let payload = self
            .compile_presence(&template, true)
            .and_then(|(_, activity)| activity);
        self.update_presence(payload).await;
    }

    // ---- connection lifecycle ------------------------------------------

    /// Transmit a payload, connecting first if necessary.
    ///
    /// When disconnected (and not terminally closed), at most one
    /// supervised retry loop runs at a time, gated by an atomic in-flight
    /// flag. Once connected, structurally identical payloads are
    /// suppressed unless duplicates are explicitly allowed.
    pub async fn update_presence(self: &Arc<Self>, payload: Option<Activity>) {
        if !self.is_connected()
            && !self.is_closed()
            && self
                .retry_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let client = Arc::clone(self);
            let handle = tokio::spawn(async move {
                client.run_retry_loop().await;
            });
            *self.retry_task.lock().expect("retry task lock poisoned") = Some(handle);
        }

        if !self.is_connected() {
            return;
        }

        let should_send = self.config.allow_duplicate_activities || {
            let last = self.last_payload.lock().expect("payload lock poisoned");
            last.as_ref() != Some(&payload)
        };
        if !should_send {
            trace!("Duplicate payload suppressed");
            return;
        }

        match self.transport.set_activity(payload.clone()).await {
            Ok(()) => {
                *self.last_payload.lock().expect("payload lock poisoned") = Some(payload);
                debug!("Activity transmitted");
            }
            Err(err) => warn!(%err, "Failed to transmit activity"),
        }
    }

    async fn run_retry_loop(&self) {
        let mut attempts = self.config.max_connection_attempts;
        info!(attempts, "Connecting to the presence service");

        // The continuation condition deliberately does not re-check
        // Closed: a hard failure mid-loop still consumes the remaining
        // attempts, keeping the attempt count exact.
        while !self.transport.is_connected() && attempts > 0 {
            attempts -= 1;
            match self.transport.connect().await {
                Ok(()) => {
                    for kind in [
                        EventKind::ActivityJoin,
                        EventKind::ActivityJoinRequest,
                        EventKind::ActivitySpectate,
                    ] {
                        if let Err(err) = self.transport.subscribe(kind).await {
                            warn!(%err, evt = kind.as_str(), "Subscription failed");
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(%err, remaining = attempts, "Presence service unavailable");
                }
                // The socket opened but the service refused the session.
                Err(TransportError::HandshakeFailed(reason)) => {
                    error!(%reason, "Presence session rejected");
                    self.set_status(Status::Invalid);
                }
                Err(err) => {
                    error!(%err, "Connection attempt failed");
                    self.set_status(Status::Closed);
                }
            }
        }

        if !self.transport.is_connected() && self.status() != Status::Invalid {
            info!("Connection attempts exhausted");
            self.set_status(Status::Closed);
        }
        self.retry_in_flight.store(false, Ordering::SeqCst);
    }

    /// Await the in-flight retry loop, if any.
    pub async fn join_retry(&self) {
        let handle = self
            .retry_task
            .lock()
            .expect("retry task lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(%err, "Retry task panicked");
            }
        }
    }

    /// React to a transport event.
    pub async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Ready { user } => {
                info!(user = %user.username, "Presence session ready");
                *self.current_user.lock().expect("user lock poisoned") = Some(user);
                self.set_status(Status::Ready);
            }
            TransportEvent::Disconnected { code, message } => {
                warn!(code, %message, "Presence service disconnected");
                self.shutdown(true).await;
            }
            TransportEvent::Error { code, message } => {
                warn!(code, %message, "Presence service reported an error");
            }
            TransportEvent::JoinGame { secret } => {
                self.set_status(Status::JoinGame);
                let callback = self
                    .on_join_secret
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(callback) = callback {
                    callback(&secret);
                }
            }
            TransportEvent::SpectateGame { secret } => {
                self.set_status(Status::SpectateGame);
                let callback = self
                    .on_spectate_secret
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(callback) = callback {
                    callback(&secret);
                }
            }
            TransportEvent::JoinRequest { user } => {
                let privacy = self.party.lock().expect("party lock poisoned").privacy;
                let prompting = self.status() == Status::JoinRequest;
                let opened = self
                    .join_gate
                    .lock()
                    .expect("join gate lock poisoned")
                    .consider(user.clone(), privacy, prompting);
                if opened {
                    self.set_status(Status::JoinRequest);
                    let callback = self
                        .on_join_request
                        .lock()
                        .expect("callback lock poisoned")
                        .clone();
                    if let Some(callback) = callback {
                        callback(&user);
                    }
                }
            }
        }
    }

    /// Advance the join-request countdown; auto-denies on expiry.
    pub async fn tick(self: &Arc<Self>) {
        let expired = self
            .join_gate
            .lock()
            .expect("join gate lock poisoned")
            .tick();
        if expired {
            info!("Join request timed out, auto-denying");
            self.respond_join(false).await;
        }
    }

    /// Answer the pending join request.
    ///
    /// The network response is skipped while disconnected, but local
    /// state is always cleaned up and the state returns to `Ready`.
    pub async fn respond_join(&self, accept: bool) {
        if self.status() != Status::JoinRequest {
            return;
        }
        let requester = self
            .join_gate
            .lock()
            .expect("join gate lock poisoned")
            .take();
        if let Some(user) = requester {
            if self.is_connected() {
                info!(user = %user.username, accept, "Responding to join request");
                if let Err(err) = self
                    .transport
                    .respond_to_join_request(&user.id, accept)
                    .await
                {
                    warn!(%err, "Failed to respond to join request");
                }
            } else {
                debug!("Disconnected, skipping join response network call");
            }
        }
        self.set_status(Status::Ready);
    }

    /// Tear down the session.
    ///
    /// Idempotent: a shutdown while unavailable is a no-op. Close errors
    /// are logged and swallowed; presence, party, identity and the icon
    /// cache are cleared; the state becomes `Disconnected` when
    /// reconnects remain allowed, else `Closed`.
    pub async fn shutdown(&self, allow_reconnects: bool) {
        if !self.is_available() {
            return;
        }
        info!("Shutting down presence session");

        if let Err(err) = self.transport.close().await {
            warn!(%err, "Error closing transport");
        }

        *self.last_payload.lock().expect("payload lock poisoned") = None;
        *self
            .current_presence
            .lock()
            .expect("presence lock poisoned") = None;
        *self.current_user.lock().expect("user lock poisoned") = None;
        *self.party.lock().expect("party lock poisoned") = PartySession::default();
        self.join_gate
            .lock()
            .expect("join gate lock poisoned")
            .take();
        self.icons.clear();

        self.set_status(if allow_reconnects {
            Status::Disconnected
        } else {
            Status::Closed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    #[derive(Clone, Copy, PartialEq)]
    enum ConnectBehavior {
        Succeed,
        FailTransient,
        FailFatal,
    }

    struct MockTransport {
        behavior: ConnectBehavior,
        connected: AtomicBool,
        connect_attempts: AtomicU32,
        close_calls: AtomicU32,
        sent: Mutex<Vec<Option<Activity>>>,
        subscriptions: Mutex<Vec<EventKind>>,
        responses: Mutex<Vec<(String, bool)>>,
    }

    impl MockTransport {
        fn new(behavior: ConnectBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                connected: AtomicBool::new(false),
                connect_attempts: AtomicU32::new(0),
                close_calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            })
        }

        fn connected(behavior: ConnectBehavior) -> Arc<Self> {
            let transport = Self::new(behavior);
            transport.connected.store(true, Ordering::SeqCst);
            transport
        }

        fn attempts(&self) -> u32 {
            self.connect_attempts.load(Ordering::SeqCst)
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                ConnectBehavior::Succeed => {
                    self.connected.store(true, Ordering::SeqCst);
                    Ok(())
                }
                ConnectBehavior::FailTransient => Err(TransportError::ServiceAbsent),
                ConnectBehavior::FailFatal => {
                    Err(TransportError::HandshakeFailed("bad client id".into()))
                }
            }
        }

        async fn subscribe(&self, kind: EventKind) -> Result<(), TransportError> {
            self.subscriptions.lock().unwrap().push(kind);
            Ok(())
        }

        async fn set_activity(&self, activity: Option<Activity>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(activity);
            Ok(())
        }

        async fn respond_to_join_request(
            &self,
            user_id: &str,
            accept: bool,
        ) -> Result<(), TransportError> {
            self.responses
                .lock()
                .unwrap()
                .push((user_id.to_string(), accept));
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn config(attempts: u32) -> ClientConfig {
        ClientConfig {
            client_id: "test-app".to_string(),
            max_connection_attempts: attempts,
            word_format_passes: 0,
            join_timeout_ticks: 3,
            ..Default::default()
        }
    }

    async fn ready_client(
        transport: Arc<MockTransport>,
    ) -> Arc<PresenceClient> {
        let client = PresenceClient::new(config(3), transport);
        client.init();
        client
            .handle_event(TransportEvent::Ready {
                user: User::new("1", "local"),
            })
            .await;
        client
    }

    #[tokio::test]
    async fn test_rejected_session_consumes_attempts_and_marks_invalid() {
        let transport = MockTransport::new(ConnectBehavior::FailFatal);
        let client = PresenceClient::new(config(3), Arc::clone(&transport) as Arc<dyn Transport>);
        client.init();

        client.update_presence(None).await;
        client.join_retry().await;

        assert_eq!(transport.attempts(), 3);
        assert_eq!(client.status(), Status::Invalid);
        assert!(!client.is_available());

        // Invalid is terminal until an explicit init.
        client.init();
        assert_eq!(client.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_transient_failure_exhausts_to_closed() {
        let transport = MockTransport::new(ConnectBehavior::FailTransient);
        let client = PresenceClient::new(config(5), Arc::clone(&transport) as Arc<dyn Transport>);
        client.init();

        client.update_presence(None).await;
        client.join_retry().await;

        assert_eq!(transport.attempts(), 5);
        assert_eq!(client.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_successful_connect_subscribes_to_three_events() {
        let transport = MockTransport::new(ConnectBehavior::Succeed);
        let client = PresenceClient::new(config(3), Arc::clone(&transport) as Arc<dyn Transport>);
        client.init();

        client.update_presence(None).await;
        client.join_retry().await;

        assert_eq!(transport.attempts(), 1);
        let subscriptions = transport.subscriptions.lock().unwrap().clone();
        assert_eq!(
            subscriptions,
            vec![
                EventKind::ActivityJoin,
                EventKind::ActivityJoinRequest,
                EventKind::ActivitySpectate,
            ]
        );
    }

    #[tokio::test]
    async fn test_no_retry_when_closed() {
        let transport = MockTransport::new(ConnectBehavior::Succeed);
        let client = PresenceClient::new(config(3), Arc::clone(&transport) as Arc<dyn Transport>);
        // Never initialized: still Closed.

        client.update_presence(None).await;
        client.join_retry().await;
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_flag_blocks_second_loop() {
        let transport = MockTransport::new(ConnectBehavior::FailTransient);
        let client = PresenceClient::new(config(3), Arc::clone(&transport) as Arc<dyn Transport>);
        client.init();
        client.retry_in_flight.store(true, Ordering::SeqCst);

        client.update_presence(None).await;
        client.join_retry().await;
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_payloads_are_suppressed() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(Arc::clone(&transport)).await;

        let payload = Some(Activity::new().with_details("Exploring"));
        client.update_presence(payload.clone()).await;
        client.update_presence(payload).await;
        assert_eq!(transport.sent_count(), 1);

        client
            .update_presence(Some(Activity::new().with_details("Fishing")))
            .await;
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicates_allowed_when_configured() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = PresenceClient::new(
            ClientConfig {
                allow_duplicate_activities: true,
                ..config(3)
            },
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        client.init();
        client
            .handle_event(TransportEvent::Ready {
                user: User::new("1", "local"),
            })
            .await;

        let payload = Some(Activity::new().with_details("Exploring"));
        client.update_presence(payload.clone()).await;
        client.update_presence(payload).await;
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_compile_is_idempotent_against_stable_registry() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;
        client.sync_argument("custom.level", Value::from("5"));

        let template = PresenceTemplate {
            details: "Level {custom.level}".to_string(),
            state: "Exploring".to_string(),
            ..Default::default()
        };

        let (first, payload) = client.compile_presence(&template, true).unwrap();
        let (second, _) = client.compile_presence(&template, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.details, "Level 5");
        assert!(payload.is_some());
        assert_eq!(client.current_presence(), Some(first));
    }

    #[tokio::test]
    async fn test_primary_compile_skipped_while_disconnected() {
        let transport = MockTransport::new(ConnectBehavior::Succeed);
        let client = PresenceClient::new(config(3), transport);
        client.init();

        let template = PresenceTemplate::default();
        assert!(client.compile_presence(&template, true).is_none());
        // Secondary compiles still work.
        assert!(client.compile_presence(&template, false).is_some());
    }

    #[tokio::test]
    async fn test_compile_sanitizes_text_fields() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        let template = PresenceTemplate {
            details: "a".repeat(129),
            state: "x".to_string(),
            ..Default::default()
        };
        let (compiled, _) = client.compile_presence(&template, false).unwrap();
        assert_eq!(compiled.details, "");
        assert_eq!(compiled.state, "");
    }

    #[tokio::test]
    async fn test_compile_timestamp_pairing() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        let good = PresenceTemplate {
            start_timestamp: "1000".to_string(),
            end_timestamp: "not a number".to_string(),
            ..Default::default()
        };
        let (compiled, _) = client.compile_presence(&good, false).unwrap();
        assert_eq!((compiled.start_timestamp, compiled.end_timestamp), (1000, 0));

        let bad = PresenceTemplate {
            start_timestamp: "not a number".to_string(),
            end_timestamp: "2000".to_string(),
            ..Default::default()
        };
        let (compiled, _) = client.compile_presence(&bad, false).unwrap();
        assert_eq!((compiled.start_timestamp, compiled.end_timestamp), (0, 0));
    }

    #[tokio::test]
    async fn test_buttons_suppressed_by_session_secret() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        let mut template = PresenceTemplate::default();
        template.buttons.insert(
            "site".to_string(),
            crate::template::Button::new("Visit", "https://example.com"),
        );
        template
            .buttons
            .insert("default".to_string(), crate::template::Button::new("x", "y"));

        let (compiled, _) = client.compile_presence(&template, true).unwrap();
        assert_eq!(compiled.buttons.len(), 1);
        assert_eq!(compiled.buttons[0].label, "Visit");

        client.set_party(PartySession {
            join_secret: "secret-1".to_string(),
            ..Default::default()
        });
        let (compiled, payload) = client.compile_presence(&template, true).unwrap();
        assert!(compiled.buttons.is_empty());
        assert!(payload.unwrap().buttons.is_empty());
    }

    #[tokio::test]
    async fn test_join_request_times_out_to_auto_deny() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(Arc::clone(&transport)).await;
        client.set_party(PartySession {
            privacy: PartyPrivacy::Private,
            ..Default::default()
        });

        client
            .handle_event(TransportEvent::JoinRequest {
                user: User::new("42", "visitor"),
            })
            .await;
        assert_eq!(client.status(), Status::JoinRequest);

        // join_timeout_ticks = 3 in the test config.
        client.tick().await;
        client.tick().await;
        assert_eq!(client.status(), Status::JoinRequest);
        client.tick().await;

        assert_eq!(client.status(), Status::Ready);
        let responses = transport.responses.lock().unwrap().clone();
        assert_eq!(responses, vec![("42".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_public_party_ignores_join_requests() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        client
            .handle_event(TransportEvent::JoinRequest {
                user: User::new("42", "visitor"),
            })
            .await;
        assert_eq!(client.status(), Status::Ready);
    }

    #[tokio::test]
    async fn test_respond_while_disconnected_cleans_local_state() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(Arc::clone(&transport)).await;
        client.set_party(PartySession {
            privacy: PartyPrivacy::Private,
            ..Default::default()
        });
        client
            .handle_event(TransportEvent::JoinRequest {
                user: User::new("42", "visitor"),
            })
            .await;

        // Drop the pipe out from under the pending request.
        transport.connected.store(false, Ordering::SeqCst);
        client.respond_join(true).await;

        assert_eq!(client.status(), Status::Ready);
        assert!(transport.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(Arc::clone(&transport)).await;
        client.set_party(PartySession {
            id: "party-1".to_string(),
            ..Default::default()
        });

        client.shutdown(true).await;
        assert_eq!(client.status(), Status::Disconnected);
        assert_eq!(client.party(), PartySession::default());
        assert!(client.current_user().is_none());
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);

        // Already unavailable: a second shutdown is a no-op.
        client.shutdown(false).await;
        assert_eq!(client.status(), Status::Disconnected);
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_clears_icon_cache() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;
        client.assets().insert(crate::assets::Asset::canonical("world", "1"));

        assert_eq!(client.resolve_icon(false, false, &["world"]), "world");
        assert!(!client.icon_resolver().is_empty());

        client.shutdown(true).await;
        assert!(client.icon_resolver().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_event_allows_reconnect() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        client
            .handle_event(TransportEvent::Disconnected {
                code: 1000,
                message: "bye".to_string(),
            })
            .await;
        assert_eq!(client.status(), Status::Disconnected);
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_join_secret_callback() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        let seen = Arc::new(Mutex::new(String::new()));
        let captured = Arc::clone(&seen);
        client.on_join_secret(move |secret| {
            *captured.lock().unwrap() = secret.to_string();
        });

        client
            .handle_event(TransportEvent::JoinGame {
                secret: "j-1".to_string(),
            })
            .await;
        assert_eq!(client.status(), Status::JoinGame);
        assert_eq!(*seen.lock().unwrap(), "j-1");
    }

    #[tokio::test]
    async fn test_forced_template_selection_precedence() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        client.set_default_template(PresenceTemplate {
            details: "default".to_string(),
            ..Default::default()
        });
        client.set_forced_template(
            "disabled",
            PresenceTemplate {
                enabled: false,
                use_as_main: true,
                details: "disabled".to_string(),
                ..Default::default()
            },
        );
        client.set_forced_template(
            "secondary",
            PresenceTemplate {
                use_as_main: false,
                details: "secondary".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(client.select_template().details, "default");

        client.set_forced_template(
            "main",
            PresenceTemplate {
                use_as_main: true,
                details: "forced".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(client.select_template().details, "forced");

        assert_eq!(client.override_text("details"), Some("secondary".to_string()));

        client.clear_forced_template("main");
        assert_eq!(client.select_template().details, "default");
    }

    #[tokio::test]
    async fn test_sync_dynamic_variables_diffs() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;

        let mut vars = BTreeMap::new();
        vars.insert("level".to_string(), "5".to_string());
        vars.insert("zone".to_string(), "hub".to_string());
        client.sync_dynamic_variables(vars);
        assert!(client.registry().contains("custom.level"));
        assert!(client.registry().contains("custom.zone"));

        let mut next = BTreeMap::new();
        next.insert("level".to_string(), "6".to_string());
        client.sync_dynamic_variables(next);
        assert!(!client.registry().contains("custom.zone"));
        assert_eq!(client.registry().get("custom.level")(), Value::from("6"));
    }

    #[tokio::test]
    async fn test_plain_text_bypass_in_adapter() {
        let transport = MockTransport::connected(ConnectBehavior::Succeed);
        let client = ready_client(transport).await;
        client.sync_argument("custom.level", Value::from("5"));

        let evaluated = client.scripts().compile("{custom.level}", "", false, &[])();
        assert_eq!(evaluated, Value::from("5"));

        let literal = client.scripts().compile("{custom.level}", "", true, &[])();
        assert_eq!(literal, Value::from("{custom.level}"));
    }
}
