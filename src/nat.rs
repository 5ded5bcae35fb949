use crate::{
    dialer::{Connector, ProxyStream},
    Error, Result,
};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

/// Idle window after which a UDP session is torn down.
const UDP_TIMEOUT: Duration = Duration::from_secs(60);
/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Bound on how long losers wait for the winner's dial.
const INIT_WAIT: Duration = Duration::from_secs(5);
const FAN_OUT_BUFFER: usize = 4096;

type EntryMap = Arc<Mutex<HashMap<String, Arc<NatEntry>>>>;

/// One tunnelled UDP association.
///
/// States: initializing (latch open), ready (outbound present, no init
/// error), failed (latch closed with an error recorded, entry already
/// removed). Exactly one entry exists per key at any moment.
pub struct NatEntry {
    key: String,
    /// Identifies the inbound endpoint the fan-out is wired to; a new
    /// stream for the same 5-tuple makes the entry stale.
    flow_tag: u64,
    ready: watch::Receiver<bool>,
    outbound: tokio::sync::Mutex<Option<WriteHalf<ProxyStream>>>,
    init_error: Mutex<Option<String>>,
    last_active: Mutex<Instant>,
    cancel: CancellationToken,
}

impl NatEntry {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow() && self.init_error.lock().unwrap().is_none()
    }

    /// Push one inbound datagram to the proxy, boundary preserved.
    pub async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let mut guard = self.outbound.lock().await;
        let outbound = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session torn down"))?;
        outbound.write_all(datagram).await?;
        outbound.flush().await?;
        self.touch();
        Ok(())
    }
}

/// Per-key single-flight creation of proxy tunnels for UDP flows, with
/// idle garbage collection and fan-out back to the inbound endpoint.
pub struct UdpNatManager {
    connector: Arc<dyn Connector>,
    entries: EntryMap,
    token: CancellationToken,
}

impl UdpNatManager {
    pub fn new(connector: Arc<dyn Connector>, token: CancellationToken) -> Self {
        let entries: EntryMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(sweep_loop(entries.clone(), token.clone()));
        Self {
            connector,
            entries,
            token,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Obtain the session for `key`, dialing it if absent. Concurrent
    /// callers with the same key share one dial: the winner inserts a
    /// placeholder and completes the latch, losers wait on it (bounded)
    /// and then observe the same session or the same init error.
    ///
    /// `flow_tag` names the inbound stream whose write half was handed
    /// over; an existing entry wired to a different stream is stale and
    /// is torn down before an error is returned (the client's retry
    /// then builds a fresh one).
    pub async fn get_or_create(
        &self,
        key: &str,
        flow_tag: u64,
        inbound: WriteHalf<ProxyStream>,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Arc<NatEntry>> {
        let existing = {
            let entries = self.entries.lock().unwrap();
            entries.get(key).cloned()
        };
        if let Some(existing) = existing {
            return self.join_existing(key, flow_tag, existing).await;
        }

        let winner = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some(existing) => Err(existing.clone()),
                None => {
                    let (ready_tx, ready_rx) = watch::channel(false);
                    let entry = Arc::new(NatEntry {
                        key: key.to_string(),
                        flow_tag,
                        ready: ready_rx,
                        outbound: tokio::sync::Mutex::new(None),
                        init_error: Mutex::new(None),
                        last_active: Mutex::new(Instant::now()),
                        cancel: self.token.child_token(),
                    });
                    entries.insert(key.to_string(), entry.clone());
                    Ok((ready_tx, entry))
                }
            }
        };
        let (ready_tx, entry) = match winner {
            Ok(pair) => pair,
            Err(existing) => return self.join_existing(key, flow_tag, existing).await,
        };

        // Winner: dial outside the map lock.
        match self.connector.connect(dst_host, dst_port).await {
            Ok(stream) => {
                let (out_rd, out_wr) = tokio::io::split(stream);
                *entry.outbound.lock().await = Some(out_wr);
                let _ = ready_tx.send(true);
                tokio::spawn(fan_out(self.entries.clone(), entry.clone(), out_rd, inbound));
                log::info!("[NAT] session created for {key}");
                Ok(entry)
            }
            Err(e) => {
                *entry.init_error.lock().unwrap() = Some(e.to_string());
                let _ = ready_tx.send(true);
                self.entries.lock().unwrap().remove(key);
                log::warn!("[NAT] session init for {key} failed: {e}");
                Err(e)
            }
        }
    }

    async fn join_existing(
        &self,
        key: &str,
        flow_tag: u64,
        existing: Arc<NatEntry>,
    ) -> Result<Arc<NatEntry>> {
        let mut ready = existing.ready.clone();
        tokio::time::timeout(INIT_WAIT, ready.wait_for(|done| *done))
            .await
            .map_err(|_| Error::SessionTimeout(format!("udp session init wait for {key}")))?
            .map_err(|_| Error::SessionTimeout(format!("udp session init abandoned for {key}")))?;

        if let Some(message) = existing.init_error.lock().unwrap().clone() {
            return Err(Error::Dial(format!("udp session init failed: {message}")));
        }

        if existing.flow_tag != flow_tag {
            // The fan-out is wired to a dead inbound stream.
            log::info!("[NAT] stale session for {key}, tearing down");
            existing.cancel.cancel();
            self.entries.lock().unwrap().remove(key);
            return Err(Error::SessionTimeout(format!("stale udp session for {key}")));
        }

        existing.touch();
        Ok(existing)
    }
}

/// Copy proxy-side chunks back to the inbound endpoint until the read
/// deadline, cancellation or either side closing ends the session.
async fn fan_out(
    entries: EntryMap,
    entry: Arc<NatEntry>,
    mut out_rd: ReadHalf<ProxyStream>,
    mut inbound: WriteHalf<ProxyStream>,
) {
    let mut buf = vec![0u8; FAN_OUT_BUFFER];
    loop {
        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            read = tokio::time::timeout(UDP_TIMEOUT, out_rd.read(&mut buf)) => match read {
                Ok(Ok(n)) if n > 0 => {
                    entry.touch();
                    if inbound.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
        }
    }
    entry.outbound.lock().await.take();
    let mut entries = entries.lock().unwrap();
    if let Some(current) = entries.get(&entry.key) {
        if Arc::ptr_eq(current, &entry) {
            entries.remove(&entry.key);
        }
    }
    log::debug!("[NAT] session for {} closed", entry.key);
}

/// Periodically drop ready entries that sat idle past the UDP window.
/// Initializing entries are skipped; they clean up after themselves.
async fn sweep_loop(entries: EntryMap, token: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let expired: Vec<Arc<NatEntry>> = entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.is_ready() && e.idle_for() > UDP_TIMEOUT)
            .cloned()
            .collect();
        for entry in expired {
            log::debug!("[NAT] expiring idle session {}", entry.key);
            entry.cancel.cancel();
            let mut map = entries.lock().unwrap();
            if let Some(current) = map.get(&entry.key) {
                if Arc::ptr_eq(current, &entry) {
                    map.remove(&entry.key);
                }
            }
        }
    }
}
