//! Tried table collisions.
//!
//! When an address we just connected to wants a tried slot that's already taken, we don't
//! evict the incumbent right away: it earned its place, and an attacker could use fresh
//! connections to flush our tried table. Instead we remember the collision, and later check
//! whether the incumbent is still alive. Only if it isn't does the challenger take over.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bucket::bucket_position;
use crate::bucket::tried_bucket;
use crate::bucket::Table;
use crate::manager::AddrMan;
use crate::manager::AddrManInner;

/// If the incumbent connected successfully this recently, it keeps its slot without a probe
pub const REPLACEMENT: u64 = 4 * 60 * 60; // 4 hours

/// How long the TCP probe waits for a connection by default
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
/// We couldn't even try to reach an address
pub enum ProbeError {
    /// The local network stack refused to make the attempt
    Io(std::io::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Io(err) => write!(f, "Io error: {err}"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Tells whether an address is reachable right now.
///
/// Returning `Ok(false)` means the address didn't answer. Errors mean we couldn't tell, and
/// the incumbent is given the benefit of the doubt. Implementations own their timeouts.
pub trait ConnectivityProbe: Send + Sync {
    fn test_connection(
        &self,
        address: SocketAddr,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send;
}

#[derive(Debug, Clone, Copy)]
/// Probes an address by opening (and immediately dropping) a TCP connection to it
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        TcpConnectProbe { timeout }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        TcpConnectProbe::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl ConnectivityProbe for TcpConnectProbe {
    fn test_connection(
        &self,
        address: SocketAddr,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send {
        let timeout = self.timeout;

        async move {
            match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
                Ok(Ok(_stream)) => Ok(true),
                Ok(Err(err)) => match err.kind() {
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut => {
                        debug!("{address} is unreachable: {err}");
                        Ok(false)
                    }
                    _ => Err(ProbeError::Io(err)),
                },
                Err(_) => {
                    debug!("{address} didn't answer in {timeout:?}");
                    Ok(false)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What [`AddrMan::resolve_collisions`] did
pub enum CollisionResolution {
    /// There was no pending collision
    NoCollision,

    /// The challenger is gone or already in the tried table, the collision was dropped
    Dropped,

    /// The tried slot got free in the meantime, the challenger took it
    Promoted(SocketAddr),

    /// The incumbent is still around, the challenger was sent back to the new table
    IncumbentKept {
        incumbent: SocketAddr,
        challenger: SocketAddr,
    },

    /// The incumbent didn't answer, it went to the new table and the challenger took
    /// its slot
    IncumbentEvicted {
        incumbent: SocketAddr,
        challenger: SocketAddr,
    },

    /// The tables changed while we were probing, nothing was done. The collision, if still
    /// pending, will be looked at again next time.
    Stale,
}

/// A collision waiting for the incumbent to be probed. Ids may be reused after a clear or a
/// reload, so the addresses are kept too and both must still match when the answer arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingProbe {
    pub(crate) challenger: usize,
    pub(crate) challenger_addr: SocketAddr,
    pub(crate) incumbent: usize,
    pub(crate) incumbent_addr: SocketAddr,
}

/// The first half of a resolution, decided under the lock
pub(crate) enum CollisionCheck {
    /// Nothing left to do
    Done(CollisionResolution),

    /// We need to know whether the incumbent is alive
    Probe(PendingProbe),
}

impl AddrManInner {
    /// Returns who holds the tried slot wanted by `challenger`, if anyone
    fn tried_occupant(&self, challenger: usize) -> Option<usize> {
        let info = self.map_info.get(&challenger)?;
        let bucket = tried_bucket(&self.key, &self.netgroup, &info.addr);
        let position = bucket_position(&self.key, Table::Tried, bucket, &info.addr);

        self.tried_table.get(bucket, position)
    }

    /// The challenger lost, make it less likely to be picked for a while
    fn discard_challenger(&mut self, challenger: usize, now: u64) {
        self.tried_collision = None;
        if let Some(info) = self.map_info.get_mut(&challenger) {
            info.last_try = now;
        }
    }

    pub(crate) fn check_collision(&mut self, now: u64) -> CollisionCheck {
        let Some(challenger) = self.tried_collision else {
            return CollisionCheck::Done(CollisionResolution::NoCollision);
        };

        let challenger_addr = match self.map_info.get(&challenger) {
            Some(info) if !info.in_tried && info.ref_count > 0 => info.addr,
            _ => {
                self.tried_collision = None;
                return CollisionCheck::Done(CollisionResolution::Dropped);
            }
        };

        let Some(incumbent) = self.tried_occupant(challenger) else {
            // not a collision anymore
            self.make_tried(challenger, now);
            self.tried_collision = None;
            info!("Moved {challenger_addr} to the tried table, its slot got free");

            return CollisionCheck::Done(CollisionResolution::Promoted(challenger_addr));
        };

        let Some(incumbent_info) = self.map_info.get(&incumbent) else {
            self.tried_collision = None;
            return CollisionCheck::Done(CollisionResolution::Dropped);
        };

        let incumbent_addr = incumbent_info.addr;
        if now.saturating_sub(incumbent_info.last_success) < REPLACEMENT {
            debug!("{incumbent_addr} connected recently, keeping it over {challenger_addr}");
            self.discard_challenger(challenger, now);

            return CollisionCheck::Done(CollisionResolution::IncumbentKept {
                incumbent: incumbent_addr,
                challenger: challenger_addr,
            });
        }

        CollisionCheck::Probe(PendingProbe {
            challenger,
            challenger_addr,
            incumbent,
            incumbent_addr,
        })
    }

    pub(crate) fn apply_probe_result(
        &mut self,
        pending: &PendingProbe,
        reachable: Result<bool, ProbeError>,
        now: u64,
    ) -> CollisionResolution {
        let PendingProbe {
            challenger,
            challenger_addr,
            incumbent,
            incumbent_addr,
        } = *pending;

        // someone may have changed things while we weren't holding the lock
        if self.tried_collision != Some(challenger) {
            return CollisionResolution::Stale;
        }

        let still_new = self.map_info.get(&challenger).is_some_and(|info| {
            info.addr == challenger_addr && !info.in_tried && info.ref_count > 0
        });

        if !still_new || self.tried_occupant(challenger) != Some(incumbent) {
            return CollisionResolution::Stale;
        }

        let Some(incumbent_info) = self.map_info.get_mut(&incumbent) else {
            return CollisionResolution::Stale;
        };

        // the answer is about the address we probed, not whoever holds this id now
        if incumbent_info.addr != incumbent_addr {
            return CollisionResolution::Stale;
        }

        match reachable {
            Ok(true) => {
                incumbent_info.last_success = now;
                incumbent_info.last_try = now;
                incumbent_info.attempts = 0;

                self.discard_challenger(challenger, now);
                debug!("{incumbent_addr} is still alive, keeping it in the tried table");

                CollisionResolution::IncumbentKept {
                    incumbent: incumbent_addr,
                    challenger: challenger_addr,
                }
            }
            Ok(false) => {
                incumbent_info.last_try = now;
                if incumbent_info.last_count_attempt < self.last_good {
                    incumbent_info.last_count_attempt = now;
                    incumbent_info.attempts = incumbent_info.attempts.saturating_add(1);
                }

                self.make_tried(challenger, now);
                self.tried_collision = None;
                info!("{incumbent_addr} is unreachable, replaced by {challenger_addr}");

                CollisionResolution::IncumbentEvicted {
                    incumbent: incumbent_addr,
                    challenger: challenger_addr,
                }
            }
            Err(err) => {
                warn!("Couldn't probe {incumbent_addr}, keeping it in the tried table: {err}");
                self.discard_challenger(challenger, now);

                CollisionResolution::IncumbentKept {
                    incumbent: incumbent_addr,
                    challenger: challenger_addr,
                }
            }
        }
    }
}

impl AddrMan {
    /// Settles the pending tried table collision, if any.
    ///
    /// If the incumbent connected successfully in the last [`REPLACEMENT`] seconds, it
    /// stays. Otherwise we ask `probe` whether it's reachable, without holding the lock. If
    /// it is, or if the probe can't tell, the incumbent stays and the challenger is put on
    /// a cooldown. If it isn't, the incumbent goes back to the new table and the challenger
    /// takes its slot.
    ///
    /// This is a no-op when there's no pending collision, so it's safe to call periodically.
    pub async fn resolve_collisions<P: ConnectivityProbe>(
        &self,
        probe: &P,
    ) -> CollisionResolution {
        let check = self.inner.lock().check_collision(self.clock.now());

        let pending = match check {
            CollisionCheck::Done(resolution) => return resolution,
            CollisionCheck::Probe(pending) => pending,
        };

        let reachable = probe.test_connection(pending.incumbent_addr).await;

        let now = self.clock.now();
        self.inner.lock().apply_probe_result(&pending, reachable, now)
    }
}

#[cfg(test)]
mod test {
    use std::future::ready;
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::CollisionCheck;
    use super::CollisionResolution;
    use super::ConnectivityProbe;
    use super::PendingProbe;
    use super::ProbeError;
    use super::TcpConnectProbe;
    use super::REPLACEMENT;
    use crate::manager::test::addr;
    use crate::manager::test::ip;
    use crate::manager::test::make_addrman;
    use crate::manager::test::peer;
    use crate::manager::test::NOW;
    use crate::manager::AddrMan;

    /// Always answers the same thing, and counts how many times it was asked
    struct MockProbe {
        answer: fn() -> Result<bool, ProbeError>,
        calls: AtomicUsize,
    }

    impl MockProbe {
        fn new(answer: fn() -> Result<bool, ProbeError>) -> Self {
            MockProbe {
                answer,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ConnectivityProbe for MockProbe {
        fn test_connection(
            &self,
            _address: SocketAddr,
        ) -> impl Future<Output = Result<bool, ProbeError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ready((self.answer)())
        }
    }

    /// Promotes addresses in 250.1.1.0/24 until one of them collides. Successes are dated
    /// long enough ago that incumbents must be probed. Returns the challenger and the
    /// incumbent holding its slot.
    fn make_collision(addrman: &AddrMan) -> (SocketAddr, SocketAddr) {
        let good_time = NOW - REPLACEMENT - 60 * 60;

        for i in 1..=255 {
            let address = addr(&format!("250.1.1.{i}:8333"));
            addrman.add(
                &[peer(&format!("250.1.1.{i}:8333"))],
                ip(&format!("252.{i}.1.1")),
            );

            if addrman.find(&address).is_none() {
                continue;
            }

            if !addrman.good_at(&address, good_time) {
                let inner = addrman.inner.lock();
                let challenger = inner.find(&address).unwrap();
                let incumbent = inner.tried_occupant(challenger).unwrap();
                let incumbent = inner.map_info[&incumbent].addr;

                return (address, incumbent);
            }
        }

        panic!("255 addresses in a /16 must collide in the tried table");
    }

    #[tokio::test]
    async fn test_no_collision() {
        let (addrman, _) = make_addrman(None);
        let probe = MockProbe::new(|| Ok(true));

        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::NoCollision
        );
        assert!(addrman.select_tried_collision().is_none());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_incumbent_unreachable() {
        let (addrman, _) = make_addrman(None);
        let (challenger, incumbent) = make_collision(&addrman);
        let size = addrman.size();
        let tried = addrman.tried_count();

        assert_eq!(addrman.select_tried_collision().unwrap().addr, challenger);

        let probe = MockProbe::new(|| Ok(false));
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::IncumbentEvicted {
                incumbent,
                challenger
            }
        );
        assert_eq!(probe.calls(), 1);

        assert!(addrman.find(&challenger).unwrap().in_tried());
        assert_eq!(addrman.tried_count(), tried);
        assert!(addrman.select_tried_collision().is_none());

        // the incumbent is either back in new, or gone
        match addrman.find(&incumbent) {
            Some(info) => {
                assert!(!info.in_tried());
                assert_eq!(info.last_try, NOW);
                assert_eq!(addrman.size(), size);
            }
            None => assert_eq!(addrman.size(), size - 1),
        }

        addrman.check().unwrap();

        // resolving again does nothing
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::NoCollision
        );
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_incumbent_reachable() {
        let (addrman, _) = make_addrman(None);
        let (challenger, incumbent) = make_collision(&addrman);
        let size = addrman.size();
        let tried = addrman.tried_count();

        let probe = MockProbe::new(|| Ok(true));
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::IncumbentKept {
                incumbent,
                challenger
            }
        );
        assert_eq!(probe.calls(), 1);

        let info = addrman.find(&incumbent).unwrap();
        assert!(info.in_tried());
        assert_eq!(info.last_success, NOW);

        // the challenger is still in new, but cooling down
        let info = addrman.find(&challenger).unwrap();
        assert!(!info.in_tried());
        assert_eq!(info.last_try, NOW);
        assert!(info.chance(NOW) < 0.02);

        assert_eq!(addrman.size(), size);
        assert_eq!(addrman.tried_count(), tried);
        assert!(addrman.select_tried_collision().is_none());
        addrman.check().unwrap();
    }

    #[tokio::test]
    async fn test_probe_error_keeps_incumbent() {
        let (addrman, _) = make_addrman(None);
        let (challenger, incumbent) = make_collision(&addrman);

        let probe = MockProbe::new(|| Err(ProbeError::Io(std::io::Error::other("no route"))));
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::IncumbentKept {
                incumbent,
                challenger
            }
        );

        assert!(addrman.find(&incumbent).unwrap().in_tried());
        assert!(!addrman.find(&challenger).unwrap().in_tried());
        assert!(addrman.select_tried_collision().is_none());
        addrman.check().unwrap();
    }

    #[tokio::test]
    async fn test_recent_incumbent_is_not_probed() {
        let (addrman, clock) = make_addrman(None);
        let (challenger, incumbent) = make_collision(&addrman);

        // the incumbent connected a moment ago
        clock.advance(60);
        addrman.good(&incumbent);

        let probe = MockProbe::new(|| Ok(false));
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::IncumbentKept {
                incumbent,
                challenger
            }
        );
        assert_eq!(probe.calls(), 0);
        assert!(addrman.find(&incumbent).unwrap().in_tried());
        addrman.check().unwrap();
    }

    #[tokio::test]
    async fn test_challenger_gone() {
        let (addrman, _) = make_addrman(None);
        let (challenger, _) = make_collision(&addrman);

        {
            let mut inner = addrman.inner.lock();
            let id = inner.find(&challenger).unwrap();
            inner.delete(id);
        }

        let probe = MockProbe::new(|| Ok(false));
        assert!(addrman.select_tried_collision().is_none());
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::NoCollision
        );
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_slot_freed() {
        let (addrman, _) = make_addrman(None);
        let (challenger, incumbent) = make_collision(&addrman);

        {
            let mut inner = addrman.inner.lock();
            let id = inner.find(&incumbent).unwrap();
            inner.delete(id);
        }

        let probe = MockProbe::new(|| Ok(true));
        assert_eq!(
            addrman.resolve_collisions(&probe).await,
            CollisionResolution::Promoted(challenger)
        );
        assert_eq!(probe.calls(), 0);
        assert!(addrman.find(&challenger).unwrap().in_tried());
        addrman.check().unwrap();
    }

    /// Takes the collision check that would precede a probe
    fn pending(addrman: &AddrMan) -> PendingProbe {
        match addrman.inner.lock().check_collision(NOW) {
            CollisionCheck::Probe(pending) => pending,
            CollisionCheck::Done(resolution) => panic!("expected a probe, got {resolution:?}"),
        }
    }

    #[test]
    fn test_changes_while_probing() {
        let (addrman, _) = make_addrman(None);
        let (_, incumbent) = make_collision(&addrman);
        let pending = pending(&addrman);

        // the collision got resolved by someone else before the answer came back
        addrman.inner.lock().tried_collision = None;
        let resolution = addrman
            .inner
            .lock()
            .apply_probe_result(&pending, Ok(false), NOW);

        assert_eq!(resolution, CollisionResolution::Stale);
        assert!(addrman.find(&incumbent).unwrap().in_tried());
        addrman.check().unwrap();
    }

    #[test]
    fn test_answer_for_another_address() {
        let (addrman, _) = make_addrman(None);
        let (challenger, incumbent) = make_collision(&addrman);
        let pending = pending(&addrman);

        // same ids, but the address we asked about isn't the one holding the slot anymore,
        // like after a clear or a reload
        let moved = PendingProbe {
            incumbent_addr: addr("250.99.1.1:8333"),
            ..pending
        };
        let resolution = addrman
            .inner
            .lock()
            .apply_probe_result(&moved, Ok(false), NOW);

        assert_eq!(resolution, CollisionResolution::Stale);
        assert!(addrman.find(&incumbent).unwrap().in_tried());
        assert!(!addrman.find(&challenger).unwrap().in_tried());
        assert_eq!(addrman.select_tried_collision().unwrap().addr, challenger);

        // same for the challenger
        let moved = PendingProbe {
            challenger_addr: addr("250.99.1.1:8333"),
            ..pending
        };
        let resolution = addrman
            .inner
            .lock()
            .apply_probe_result(&moved, Ok(false), NOW);

        assert_eq!(resolution, CollisionResolution::Stale);
        assert!(addrman.find(&incumbent).unwrap().in_tried());

        // the real answer still applies
        let resolution = addrman
            .inner
            .lock()
            .apply_probe_result(&pending, Ok(false), NOW);
        assert_eq!(
            resolution,
            CollisionResolution::IncumbentEvicted {
                incumbent,
                challenger
            }
        );
        addrman.check().unwrap();
    }

    /// Uses the address manager while answering, which would spin forever if the lock was
    /// held across the call
    struct BusyProbe {
        addrman: Arc<AddrMan>,
        newcomer: SocketAddr,
    }

    impl ConnectivityProbe for BusyProbe {
        fn test_connection(
            &self,
            _address: SocketAddr,
        ) -> impl Future<Output = Result<bool, ProbeError>> + Send {
            let addrman = self.addrman.clone();
            let newcomer = self.newcomer;

            async move {
                tokio::task::yield_now().await;
                addrman.add(&[peer(&newcomer.to_string())], ip("252.200.1.1"));
                assert!(addrman.size() > 0);

                Ok(false)
            }
        }
    }

    #[tokio::test]
    async fn test_lock_released_while_probing() {
        let (addrman, _) = make_addrman(None);
        let addrman = Arc::new(addrman);
        let (challenger, incumbent) = make_collision(&addrman);

        let newcomer = addr("250.200.1.1:8333");
        let probe = BusyProbe {
            addrman: addrman.clone(),
            newcomer,
        };

        let resolution = addrman.resolve_collisions(&probe).await;

        assert_eq!(
            resolution,
            CollisionResolution::IncumbentEvicted {
                incumbent,
                challenger
            }
        );
        assert!(addrman.find(&newcomer).is_some());
        assert!(addrman.find(&challenger).unwrap().in_tried());
        addrman.check().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let probe = TcpConnectProbe::new(Duration::from_secs(5));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();
        assert!(probe.test_connection(open).await.unwrap());

        // grab a free port, then stop listening on it
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(!probe.test_connection(closed).await.unwrap());
    }
}
