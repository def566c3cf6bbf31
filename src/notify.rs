//! LISTEN/NOTIFY channel.
//!
//! Notifications arrive on one dedicated connection kept outside the pool.
//! It is opened on first use and reopened whenever it is lost; on every
//! (re)connect the whole listen set is replayed as one `LISTEN` batch.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::pg::connection::{
    ConnectOptions, Connection, ConnectionKind, ConnectionObserver, Target,
};
use crate::pg::session::{Expect, Request};
use crate::query::Query;
use crate::result::QueryResult;
use crate::schema::SchemaRegistry;

/// Delay before reopening a connection that never completed startup.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A notification received from the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Backend process that sent it
    pub process_id: i32,
    pub channel: String,
    /// JSON payload; an empty payload is `null`
    pub payload: Value,
}

/// Handle returned by [`MainChannel::on`] and [`MainChannel::once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Subscriber {
    channel: String,
    once: bool,
    callback: Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Down,
    Up,
    Closed,
}

#[derive(Default)]
struct ChannelState {
    destroyed: bool,
    conn: Option<Connection>,
    /// The current connection completed startup
    connected: bool,
    /// Channels we want to be listening on
    listen: BTreeSet<String>,
    /// Pending LISTENs
    subscribe: BTreeSet<String>,
    /// Pending UNLISTENs
    unsubscribe: BTreeSet<String>,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    next_id: u64,
}

impl ChannelState {
    fn has_subscribers(&self, channel: &str) -> bool {
        self.subscribers.values().any(|s| s.channel == channel)
    }

    fn add_channel(&mut self, channel: &str) {
        if self.listen.insert(channel.to_string()) && !self.unsubscribe.remove(channel) {
            self.subscribe.insert(channel.to_string());
        }
    }

    fn drop_channel(&mut self, channel: &str) {
        if self.listen.remove(channel) && !self.subscribe.remove(channel) {
            self.unsubscribe.insert(channel.to_string());
        }
    }
}

struct ChannelInner {
    target: Target,
    options: Arc<ConnectOptions>,
    schema: Arc<SchemaRegistry>,
    state: Mutex<ChannelState>,
    link: watch::Sender<Link>,
    weak: Weak<ChannelInner>,
}

/// The notification connection and its subscribers.
#[derive(Clone)]
pub struct MainChannel {
    inner: Arc<ChannelInner>,
}

impl MainChannel {
    pub fn new(target: Target, options: Arc<ConnectOptions>, schema: Arc<SchemaRegistry>) -> Self {
        let (link, _) = watch::channel(Link::Down);
        let inner = Arc::new_cyclic(|weak| ChannelInner {
            target,
            options,
            schema,
            state: Mutex::new(ChannelState::default()),
            link,
            weak: weak.clone(),
        });
        Self { inner }
    }

    /// Call `f` for every notification on `channel`.
    ///
    /// Fails at once when the channel is reserved or unknown.
    pub fn on<F>(&self, channel: &str, f: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe(channel, false, Arc::new(f))
    }

    /// Call `f` for the next notification on `channel` only.
    pub fn once<F>(&self, channel: &str, f: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe(channel, true, Arc::new(f))
    }

    /// Remove a subscriber. The channel is unlistened when nobody is left on it.
    pub fn off(&self, id: SubscriptionId) -> bool {
        {
            let mut state = self.inner.state.lock();
            let Some(sub) = state.subscribers.remove(&id) else {
                return false;
            };
            if !state.has_subscribers(&sub.channel) {
                state.drop_channel(&sub.channel);
            }
        }
        self.inner.sync();
        true
    }

    /// Channels currently wanted.
    pub fn channels(&self) -> Vec<String> {
        self.inner.state.lock().listen.iter().cloned().collect()
    }

    /// Send a notification with `pg_notify`.
    ///
    /// Nothing is sent while the channel is disconnected; the result is then
    /// connection-closed.
    pub async fn publish(&self, channel: &str, payload: &Value) -> QueryResult {
        let conn = {
            let mut state = self.inner.state.lock();
            self.inner.ensure_started(&mut state);
            match &state.conn {
                Some(conn) if state.connected => conn.clone(),
                _ => return QueryResult::connection_closed(),
            }
        };

        let query = Query::new("SELECT pg_notify($1, $2::text)")
            .bind(channel)
            .bind(payload.to_string());
        conn.query(query, Expect::Any).await
    }

    /// Resolve once connected, or once the channel is destroyed.
    pub async fn wait_connected(&self) {
        let mut link = self.inner.link.subscribe();
        {
            let mut state = self.inner.state.lock();
            self.inner.ensure_started(&mut state);
        }
        let _ = link.wait_for(|l| *l != Link::Down).await;
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.link.borrow() == Link::Up
    }

    /// Close the connection for good. Subscribers are kept but never called again.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    fn subscribe(&self, channel: &str, once: bool, callback: Callback) -> Result<SubscriptionId> {
        self.inner.schema.check_listen(channel)?;

        let id = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            let id = SubscriptionId(state.next_id);
            state.subscribers.insert(
                id,
                Subscriber {
                    channel: channel.to_string(),
                    once,
                    callback,
                },
            );
            state.add_channel(channel);
            self.inner.ensure_started(&mut state);
            id
        };

        self.inner.sync();
        Ok(id)
    }
}

impl ChannelInner {
    fn ensure_started(&self, state: &mut ChannelState) {
        if state.destroyed || state.conn.is_some() {
            return;
        }
        self.connect(state);
    }

    fn connect(&self, state: &mut ChannelState) {
        let observer: Weak<dyn ConnectionObserver> = self.weak.clone();
        let conn = Connection::spawn(
            ConnectionKind::Main,
            self.target.clone(),
            Arc::clone(&self.options),
            Arc::clone(&self.schema),
            Some(observer),
        );
        debug!(conn = conn.id(), "opening notification connection");
        state.conn = Some(conn);
        state.connected = false;
    }

    /// Flush pending LISTEN/UNLISTEN diffs as one statement.
    fn sync(&self) {
        let (conn, sql) = {
            let mut state = self.state.lock();
            let conn = match &state.conn {
                Some(conn) if state.connected => conn.clone(),
                _ => return,
            };
            let Some(sql) = sync_statement(&state.subscribe, &state.unsubscribe) else {
                return;
            };
            state.subscribe.clear();
            state.unsubscribe.clear();
            (conn, sql)
        };

        trace!(conn = conn.id(), %sql, "syncing channels");
        let (tx, rx) = oneshot::channel();
        if !conn.submit(Request::new(Query::new(sql), Expect::Any, tx)) {
            return;
        }

        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                if !result.ok {
                    warn!(
                        conn = conn.id(),
                        "channel sync failed: {}",
                        result.message.as_deref().unwrap_or("unknown error")
                    );
                    conn.destroy();
                }
            }
        });
    }

    fn destroy(&self) {
        let conn = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.connected = false;
            state.conn.take()
        };
        self.link.send_replace(Link::Closed);
        if let Some(conn) = conn {
            conn.destroy();
        }
    }
}

impl ConnectionObserver for ChannelInner {
    fn on_connect(&self, conn: &Connection) {
        {
            let mut state = self.state.lock();
            if state.conn.as_ref() != Some(conn) {
                return;
            }
            state.connected = true;
            state.subscribe = state.listen.clone();
            state.unsubscribe.clear();
        }
        debug!(conn = conn.id(), "notification connection ready");
        self.link.send_replace(Link::Up);
        self.sync();
    }

    fn on_destroy(&self, conn: &Connection) {
        let had_connected = {
            let mut state = self.state.lock();
            if state.conn.as_ref() != Some(conn) {
                return;
            }
            let had_connected = state.connected;
            state.conn = None;
            state.connected = false;
            if state.destroyed {
                return;
            }
            if had_connected {
                self.connect(&mut state);
            }
            had_connected
        };

        self.link.send_if_modified(|link| {
            let changed = *link == Link::Up;
            if changed {
                *link = Link::Down;
            }
            changed
        });

        if had_connected {
            debug!("notification connection lost; reconnecting");
            return;
        }

        warn!(
            "notification connection failed; retrying in {:?}",
            RECONNECT_DELAY
        );
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                inner.ensure_started(&mut state);
            }
        });
    }

    fn on_notification(&self, _conn: &Connection, notification: &Notification) {
        let callbacks = {
            let mut state = self.state.lock();
            let mut callbacks = Vec::new();
            state.subscribers.retain(|_, sub| {
                if sub.channel != notification.channel {
                    return true;
                }
                callbacks.push(Arc::clone(&sub.callback));
                !sub.once
            });

            if !state.has_subscribers(&notification.channel) {
                state.drop_channel(&notification.channel);
            }
            callbacks
        };

        trace!(channel = %notification.channel, subscribers = callbacks.len(), "notification");
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(notification))).is_err() {
                warn!(channel = %notification.channel, "notification subscriber panicked");
            }
        }
        self.sync();
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(conn) = self.state.get_mut().conn.take() {
            conn.destroy();
        }
    }
}

/// Quote a channel name as an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `LISTEN "a"; UNLISTEN "b";` for the pending diffs, or `None` when empty.
fn sync_statement(subscribe: &BTreeSet<String>, unsubscribe: &BTreeSet<String>) -> Option<String> {
    if subscribe.is_empty() && unsubscribe.is_empty() {
        return None;
    }

    let listens = subscribe
        .iter()
        .map(|c| format!("LISTEN {};", quote_ident(c)));
    let unlistens = unsubscribe
        .iter()
        .map(|c| format!("UNLISTEN {};", quote_ident(c)));
    Some(listens.chain(unlistens).collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sync_statement() {
        assert_eq!(sync_statement(&set(&[]), &set(&[])), None);
        assert_eq!(
            sync_statement(&set(&["foo"]), &set(&[])).as_deref(),
            Some("LISTEN \"foo\";")
        );
        assert_eq!(
            sync_statement(&set(&["a", "b"]), &set(&["c"])).as_deref(),
            Some("LISTEN \"a\"; LISTEN \"b\"; UNLISTEN \"c\";")
        );
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_channel_diffs_cancel_out() {
        let mut state = ChannelState::default();

        state.add_channel("foo");
        assert_eq!(state.subscribe, set(&["foo"]));

        // Dropped before it was ever sent
        state.drop_channel("foo");
        assert!(state.subscribe.is_empty());
        assert!(state.unsubscribe.is_empty());

        // Listened on the server, then dropped and re-added before a sync
        state.listen.insert("bar".to_string());
        state.drop_channel("bar");
        assert_eq!(state.unsubscribe, set(&["bar"]));
        state.add_channel("bar");
        assert!(state.unsubscribe.is_empty());
        assert!(state.subscribe.is_empty());
        assert_eq!(state.listen, set(&["bar"]));
    }

    #[test]
    fn test_reserved_channel_rejected() {
        let channel = MainChannel::new(
            Target {
                endpoint: crate::pg::connection::Endpoint::Host("localhost".to_string(), 1),
                server_name: "localhost".to_string(),
            },
            Arc::new(ConnectOptions::from_config(&crate::config::DbConfig::default())),
            Arc::new(SchemaRegistry::new()),
        );

        let err = channel.on("__schema_patch", |_| {}).unwrap_err();
        assert!(matches!(err, crate::error::Error::ReservedChannel(_)));
        assert!(channel.channels().is_empty());
    }
}
