use crate::{
    error::Result,
    models::realtime::{ChangeEvent, ChangeFilter, SubscriptionId},
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 变更通知通道接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription>;

    /// Idempotent: unknown or already-closed ids are not an error.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()>;

    /// Live subscriptions held by this feed.
    fn active_subscriptions(&self) -> usize;
}

/// A live subscription. Dropping it closes the event stream, which the feed
/// treats the same as an unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, events: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Next change, or `None` once the feed has closed the subscription.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// A change that has already arrived, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}

#[cfg(feature = "websocket")]
pub use self::websocket::RealtimeService;

#[cfg(feature = "websocket")]
mod websocket {
    use super::{ChangeFeed, Subscription};
    use crate::{
        config::Config,
        error::{AppError, Result},
        models::realtime::{ChangeEvent, ChangeFilter, ChangeKind, PhoenixMessage, SubscriptionId},
        services::auth::SessionHandle,
    };
    use async_trait::async_trait;
    use dashmap::DashMap;
    use futures::{sink::SinkExt, stream::StreamExt};
    use std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::{
        net::TcpStream,
        sync::{mpsc, oneshot},
        task::JoinHandle,
        time::{interval, sleep, timeout, MissedTickBehavior},
    };
    use tokio_tungstenite::{
        connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
    };
    use tracing::{debug, error, info, warn};
    use url::Url;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
    const RECONNECT_BACKOFF: [u64; 5] = [1, 2, 5, 10, 30];

    /// 通道句柄
    struct ChannelHandle {
        leave_tx: Option<oneshot::Sender<()>>,
        task: JoinHandle<()>,
    }

    /// Per-channel state the socket task needs to (re)join.
    struct ChannelSpec {
        id: SubscriptionId,
        topic: String,
        filter: ChangeFilter,
    }

    /// Supabase Realtime 客户端
    /// 每个订阅使用一条独立的 WebSocket 连接，断线后自动重连并触发一次重新加载
    #[derive(Clone)]
    pub struct RealtimeService {
        endpoint: Url,
        channel: String,
        anon_key: String,
        session: SessionHandle,
        heartbeat: Duration,
        channels: Arc<DashMap<SubscriptionId, ChannelHandle>>,
        next_ref: Arc<AtomicU64>,
    }

    impl RealtimeService {
        pub fn new(config: &Config, session: SessionHandle) -> Result<Self> {
            let mut endpoint = Url::parse(&config.supabase_url)?;
            let scheme = match endpoint.scheme() {
                "https" => "wss",
                "http" => "ws",
                other => {
                    return Err(AppError::Config(format!(
                        "unsupported SUPABASE_URL scheme for realtime: {}",
                        other
                    )))
                }
            };
            endpoint
                .set_scheme(scheme)
                .map_err(|_| AppError::internal("Failed to build realtime endpoint"))?;
            let path = format!("{}/realtime/v1/websocket", endpoint.path().trim_end_matches('/'));
            endpoint.set_path(&path);
            endpoint
                .query_pairs_mut()
                .clear()
                .append_pair("apikey", &config.supabase_anon_key)
                .append_pair("vsn", "1.0.0");

            Ok(Self {
                endpoint,
                channel: config.realtime_channel.clone(),
                anon_key: config.supabase_anon_key.clone(),
                session,
                heartbeat: config.realtime_heartbeat(),
                channels: Arc::new(DashMap::new()),
                next_ref: Arc::new(AtomicU64::new(1)),
            })
        }

        pub fn endpoint(&self) -> &Url {
            &self.endpoint
        }

        fn make_ref(&self) -> String {
            self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
        }

        async fn send(socket: &mut Socket, message: &PhoenixMessage) -> Result<()> {
            let text = serde_json::to_string(message)?;
            socket.send(Message::Text(text)).await?;
            Ok(())
        }

        /// Connects and joins the channel, waiting for the join reply.
        async fn connect_and_join(&self, spec: &ChannelSpec) -> Result<(Socket, String)> {
            let (mut socket, _) = connect_async(self.endpoint.as_str()).await?;

            let join_ref = self.make_ref();
            let token = self
                .session
                .access_token()
                .unwrap_or_else(|| self.anon_key.clone());
            let join = PhoenixMessage::join(&spec.topic, &spec.filter, &token, &join_ref);
            Self::send(&mut socket, &join).await?;

            let reply = timeout(JOIN_TIMEOUT, async {
                while let Some(frame) = socket.next().await {
                    let Message::Text(text) = frame? else {
                        continue;
                    };
                    let message: PhoenixMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("Ignoring unparseable realtime frame: {}", e);
                            continue;
                        }
                    };
                    if message.topic == spec.topic && message.reference.as_deref() == Some(&join_ref) {
                        if let Some(status) = message.reply_status() {
                            return Ok(status);
                        }
                    }
                }
                Err(AppError::realtime("Socket closed before join reply"))
            })
            .await
            .map_err(|_| AppError::realtime("Timed out waiting for join reply"))??;

            match reply {
                Ok(()) => {
                    info!("Joined realtime channel {} ({})", spec.topic, spec.id);
                    Ok((socket, join_ref))
                }
                Err(reason) => Err(AppError::Realtime(format!("Join rejected: {}", reason))),
            }
        }

        /// Pumps one joined socket until it ends. Returns `true` if the
        /// subscription is finished, `false` if the socket was lost.
        async fn pump(
            &self,
            spec: &ChannelSpec,
            socket: &mut Socket,
            join_ref: &str,
            events_tx: &mpsc::UnboundedSender<ChangeEvent>,
            leave_rx: &mut oneshot::Receiver<()>,
        ) -> bool {
            let mut heartbeat = interval(self.heartbeat);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    _ = &mut *leave_rx => {
                        self.leave(spec, socket, join_ref).await;
                        return true;
                    }
                    _ = events_tx.closed() => {
                        debug!("Subscriber dropped {}, leaving channel", spec.id);
                        self.leave(spec, socket, join_ref).await;
                        return true;
                    }
                    _ = heartbeat.tick() => {
                        let beat = PhoenixMessage::heartbeat(&self.make_ref());
                        if let Err(e) = Self::send(socket, &beat).await {
                            warn!("Heartbeat failed on {}: {}", spec.topic, e);
                            return false;
                        }
                    }
                    frame = socket.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_frame(spec, &text, events_tx) {
                                return false;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = socket.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Realtime socket closed for {}", spec.topic);
                            return false;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Realtime socket error on {}: {}", spec.topic, e);
                            return false;
                        }
                    }
                }
            }
        }

        /// Returns `false` when the server closed or errored the channel.
        fn handle_frame(
            &self,
            spec: &ChannelSpec,
            text: &str,
            events_tx: &mpsc::UnboundedSender<ChangeEvent>,
        ) -> bool {
            let message: PhoenixMessage = match serde_json::from_str(text) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Ignoring unparseable realtime frame: {}", e);
                    return true;
                }
            };
            if message.topic != spec.topic {
                return true;
            }

            match message.event.as_str() {
                PhoenixMessage::POSTGRES_CHANGES => {
                    if let Some(change) = message.postgres_change() {
                        if spec.filter.matches(&change) {
                            debug!("Change {:?} on {}.{}", change.kind, change.schema, change.table);
                            let _ = events_tx.send(change);
                        }
                    }
                    true
                }
                PhoenixMessage::ERROR | PhoenixMessage::CLOSE => {
                    warn!("Server closed realtime channel {}: {}", spec.topic, message.event);
                    false
                }
                _ => true,
            }
        }

        async fn leave(&self, spec: &ChannelSpec, socket: &mut Socket, join_ref: &str) {
            let leave = PhoenixMessage::leave(&spec.topic, &self.make_ref(), join_ref);
            if let Err(e) = Self::send(socket, &leave).await {
                debug!("Failed to send leave for {}: {}", spec.topic, e);
            }
            let _ = socket.close(None).await;
            info!("Left realtime channel {} ({})", spec.topic, spec.id);
        }

        async fn run_channel(
            self,
            spec: ChannelSpec,
            mut socket: Socket,
            mut join_ref: String,
            events_tx: mpsc::UnboundedSender<ChangeEvent>,
            mut leave_rx: oneshot::Receiver<()>,
        ) {
            loop {
                if self
                    .pump(&spec, &mut socket, &join_ref, &events_tx, &mut leave_rx)
                    .await
                {
                    break;
                }

                // 断线重连
                let mut attempt = 0usize;
                let rejoined = loop {
                    let delay = RECONNECT_BACKOFF[attempt.min(RECONNECT_BACKOFF.len() - 1)];
                    tokio::select! {
                        _ = &mut leave_rx => break None,
                        _ = events_tx.closed() => break None,
                        _ = sleep(Duration::from_secs(delay)) => {}
                    }
                    match self.connect_and_join(&spec).await {
                        Ok(joined) => break Some(joined),
                        Err(e) => {
                            attempt += 1;
                            warn!("Reconnect attempt {} for {} failed: {}", attempt, spec.topic, e);
                        }
                    }
                };

                let Some((new_socket, new_ref)) = rejoined else {
                    break;
                };
                socket = new_socket;
                join_ref = new_ref;

                // Changes may have been missed while disconnected.
                let resync = ChangeEvent {
                    schema: spec.filter.schema.clone(),
                    table: spec.filter.table.clone(),
                    kind: ChangeKind::Update,
                    commit_timestamp: None,
                };
                if events_tx.send(resync).is_err() {
                    self.leave(&spec, &mut socket, &join_ref).await;
                    break;
                }
            }

            self.channels.remove(&spec.id);
        }
    }

    #[async_trait]
    impl ChangeFeed for RealtimeService {
        async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription> {
            let spec = ChannelSpec {
                id: SubscriptionId::new(),
                topic: PhoenixMessage::topic_for(&self.channel),
                filter,
            };
            let (socket, join_ref) = self.connect_and_join(&spec).await?;

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (leave_tx, leave_rx) = oneshot::channel();
            let id = spec.id.clone();

            let task = tokio::spawn(
                self.clone()
                    .run_channel(spec, socket, join_ref, events_tx, leave_rx),
            );
            self.channels.insert(
                id.clone(),
                ChannelHandle {
                    leave_tx: Some(leave_tx),
                    task,
                },
            );

            Ok(Subscription::new(id, events_rx))
        }

        async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
            let Some((_, mut handle)) = self.channels.remove(id) else {
                return Ok(());
            };

            if let Some(leave_tx) = handle.leave_tx.take() {
                let _ = leave_tx.send(());
            }
            if timeout(Duration::from_secs(5), &mut handle.task).await.is_err() {
                warn!("Realtime channel {} did not leave in time, aborting", id);
                handle.task.abort();
            }
            Ok(())
        }

        fn active_subscriptions(&self) -> usize {
            self.channels
                .iter()
                .filter(|entry| !entry.value().task.is_finished())
                .count()
        }
    }

}
