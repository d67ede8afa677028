use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use tokio::sync::mpsc;
use tracing::*;
use trust_dns_resolver::TokioAsyncResolver;

/// Background reverse-DNS resolution for one connection. Lookups run on
/// their own tasks; the session loop collects results cooperatively via
/// [`RdnsHandle::drain`] and never waits on one.
pub struct RdnsHandle {
    resolver: Option<TokioAsyncResolver>,
    tx: mpsc::UnboundedSender<(u32, Option<String>)>,
    rx: mpsc::UnboundedReceiver<(u32, Option<String>)>,
    pending: HashSet<u32>,
}

impl RdnsHandle {
    pub fn new(enabled: bool) -> RdnsHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let resolver = if enabled {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(resolver) => Some(resolver),
                Err(err) => {
                    warn!("Reverse DNS disabled : {}", err);
                    None
                }
            }
        } else {
            None
        };
        RdnsHandle { resolver, tx, rx, pending: HashSet::new() }
    }

    /// Starts a lookup for the player unless one is already outstanding.
    /// Returns whether a lookup is now pending.
    pub fn spawn(&mut self, id: u32, ip: Ipv4Addr) -> bool {
        let resolver = match &self.resolver {
            Some(resolver) => resolver.clone(),
            None => return false,
        };
        if !self.pending.insert(id) {
            return true;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = resolver.reverse_lookup(IpAddr::V4(ip)).await.ok().and_then(|lookup| {
                lookup.iter().next().map(|name| name.to_utf8().trim_end_matches('.').to_string())
            });
            //The session may have detached in the meantime, that is fine
            let _ = tx.send((id, result));
        });
        true
    }

    /// Completed lookups since the last call. Results for players that were
    /// detached in the meantime are discarded.
    pub fn drain(&mut self) -> Vec<(u32, Option<String>)> {
        let mut finished = Vec::new();
        while let Ok((id, result)) = self.rx.try_recv() {
            if self.pending.remove(&id) {
                finished.push((id, result));
            }
        }
        finished
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Stops waiting for every in-flight lookup. There is no cancellation :
    /// the tasks finish on their own and their results are dropped.
    pub fn detach_all(&mut self) {
        self.pending.clear();
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_handle_never_pends() {
        let mut rdns = RdnsHandle::new(false);
        assert!(!rdns.spawn(7, Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(rdns.pending(), 0);
        assert!(rdns.drain().is_empty());
    }

    #[tokio::test]
    async fn detach_discards_late_results() {
        let mut rdns = RdnsHandle::new(false);
        //Inject a result as a finished lookup task would
        rdns.pending.insert(7);
        rdns.tx.send((7, Some("host.example".to_string()))).unwrap();
        rdns.detach_all();
        assert_eq!(rdns.pending(), 0);
        assert!(rdns.drain().is_empty());
    }

    #[tokio::test]
    async fn drain_reports_each_result_once() {
        let mut rdns = RdnsHandle::new(false);
        rdns.pending.insert(3);
        rdns.tx.send((3, None)).unwrap();
        //A stale result for a player that is not pending is dropped
        rdns.tx.send((9, Some("stale.example".to_string()))).unwrap();
        let finished = rdns.drain();
        assert_eq!(finished, vec![(3, None)]);
        assert!(rdns.drain().is_empty());
        assert_eq!(rdns.pending(), 0);
    }
}
