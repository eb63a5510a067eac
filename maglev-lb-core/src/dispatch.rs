//! The per-packet hot path.
//!
//! `dispatch` parses the flow tuple out of an Ethernet II + IPv4 frame,
//! fingerprints it, consults the worker's flow cache with the lookup table
//! as fallback, and rewrites the IPv4 destination in place. No allocation,
//! no locks, no failure path; malformed frames are the caller's problem and
//! are only checked in debug builds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{CacheConfig, FlowCache};
use crate::control::{RouterControl, RouterEpoch};
use crate::hash::{self, TUPLE_LEN};

/// Ethernet II header size.
pub const ETH_HLEN: usize = 14;

/// Minimum IPv4 header size (no options).
pub const IPV4_HLEN_MIN: usize = 20;

/// Smallest frame `dispatch` accepts: Ethernet plus the fixed IPv4 header.
pub const MIN_FRAME_LEN: usize = ETH_HLEN + IPV4_HLEN_MIN;

/// EtherType for IPv4, host order.
pub const ETH_P_IP: u16 = 0x0800;

const IPV4_IHL_OFF: usize = ETH_HLEN;
const IPV4_PROTO_OFF: usize = ETH_HLEN + 9;
const IPV4_SRC_OFF: usize = ETH_HLEN + 12;
const IPV4_DST_OFF: usize = ETH_HLEN + 16;

/// Per-worker packet dispatcher.
///
/// Owns the worker's [`FlowCache`] exclusively and reads the shared epoch
/// through an acquire load on every packet. Constructing one registers the
/// worker with the control plane; dropping it deregisters.
pub struct Dispatcher {
    control: Arc<RouterControl>,
    acked: Arc<AtomicU64>,
    cache: FlowCache,
    seen_seq: u64,
}

impl Dispatcher {
    pub fn new(control: Arc<RouterControl>, cache: CacheConfig) -> Self {
        let acked = control.register_worker();
        Self {
            control,
            acked,
            cache: FlowCache::new(cache),
            seen_seq: 0,
        }
    }

    /// Steers one frame: rewrites its IPv4 destination to the selected
    /// backend. Exactly four bytes of the frame change; everything else is
    /// left untouched, including checksums (hardware offload or a
    /// downstream stage recomputes them).
    ///
    /// The frame must start with an Ethernet II header carrying contiguous
    /// IPv4 with at least the fixed 20-byte header in the buffer.
    /// Violations are undefined in release builds.
    pub fn dispatch(&mut self, packet: &mut [u8]) {
        debug_assert!(packet.len() >= MIN_FRAME_LEN);
        debug_assert_eq!(
            u16::from_be_bytes([packet[12], packet[13]]),
            ETH_P_IP,
            "dispatch expects an IPv4 frame"
        );

        let epoch = self.observe();

        let ihl = (packet[IPV4_IHL_OFF] & 0x0f) as usize * 4;
        debug_assert!(ihl >= IPV4_HLEN_MIN);
        let l4_off = ETH_HLEN + ihl;

        // Source, destination, and the L4 port word, with the protocol
        // folded into the destination. Hashed from a stack copy so the
        // frame itself is only written once, below.
        let mut tuple = [0u8; TUPLE_LEN];
        tuple[..4].copy_from_slice(&packet[IPV4_SRC_OFF..IPV4_SRC_OFF + 4]);
        tuple[4..8].copy_from_slice(&packet[IPV4_DST_OFF..IPV4_DST_OFF + 4]);
        // Ports sharpen the fingerprint when the frame carries the L4 word;
        // an options-padded header with no payload still steers on the
        // address pair alone, zero-padded.
        if let Some(l4_word) = packet.get(l4_off..l4_off + 4) {
            tuple[8..].copy_from_slice(l4_word);
        }
        tuple[4] ^= packet[IPV4_PROTO_OFF];

        let fingerprint = hash::fingerprint(&tuple, epoch.hash_seed());
        let fallback = epoch.table().lookup(fingerprint);
        let backend = self.cache.lookup_or_insert(fingerprint, fallback);

        packet[IPV4_DST_OFF..IPV4_DST_OFF + 4]
            .copy_from_slice(epoch.backends().get(backend as usize));
    }

    /// Observes the current epoch without dispatching. Idle workers call
    /// this between empty receive batches so a table install never waits on
    /// a quiet core.
    pub fn sync_epoch(&mut self) {
        let _ = self.observe();
    }

    fn observe(&mut self) -> arc_swap::Guard<Arc<RouterEpoch>> {
        let epoch = self.control.load();
        let seq = epoch.seq();
        if seq != self.seen_seq {
            // Cached indices may point past the end of a backend set that
            // shrank; forget them before steering against the new table.
            self.cache.clear();
            self.seen_seq = seq;
        }
        self.acked.store(seq, Ordering::Release);
        epoch
    }

    /// Flow-cache hit count since construction.
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    /// Flow-cache miss count since construction.
    pub fn cache_misses(&self) -> u64 {
        self.cache.misses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSet;
    use crate::table::TableConfig;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 64];
        frame[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

        let ip = &mut frame[ETH_HLEN..ETH_HLEN + 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&50u16.to_be_bytes());
        ip[8] = 64;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);

        let udp = &mut frame[ETH_HLEN + 20..ETH_HLEN + 28];
        udp[..2].copy_from_slice(&sport.to_be_bytes());
        udp[2..4].copy_from_slice(&dport.to_be_bytes());
        udp[4..6].copy_from_slice(&30u16.to_be_bytes());

        frame
    }

    fn dst_of(frame: &[u8]) -> [u8; 4] {
        let mut dst = [0u8; 4];
        dst.copy_from_slice(&frame[IPV4_DST_OFF..IPV4_DST_OFF + 4]);
        dst
    }

    fn control_for(backends: &[[u8; 4]]) -> Arc<RouterControl> {
        let set = BackendSet::from_iter(backends.iter().map(|b| Ipv4Addr::from(*b)));
        Arc::new(RouterControl::new(set, TableConfig::default()).unwrap())
    }

    const POOL_A: [[u8; 4]; 3] = [[10, 1, 0, 1], [10, 1, 0, 2], [10, 1, 0, 3]];

    #[test]
    fn rewrites_only_the_destination() {
        let control = control_for(&POOL_A);
        let mut dispatcher = Dispatcher::new(control, CacheConfig::default());

        let original = udp_frame([10, 0, 0, 5], [10, 0, 0, 9], 4444, 9000);
        let mut frame = original.clone();
        dispatcher.dispatch(&mut frame);

        for (i, (&before, &after)) in original.iter().zip(frame.iter()).enumerate() {
            if (IPV4_DST_OFF..IPV4_DST_OFF + 4).contains(&i) {
                continue;
            }
            assert_eq!(before, after, "byte {} changed", i);
        }
        assert!(POOL_A.contains(&dst_of(&frame)), "dst not a backend");
    }

    #[test]
    fn steers_short_frames_with_ip_options() {
        let control = control_for(&POOL_A);
        let mut dispatcher = Dispatcher::new(control, CacheConfig::default());

        // IHL 24 (one option word) and nothing after the IP header: the L4
        // word is absent and the fingerprint falls back to the address pair.
        let mut frame = vec![0u8; 38];
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
        frame[ETH_HLEN] = 0x46;
        frame[ETH_HLEN + 9] = 6;
        frame[ETH_HLEN + 12..ETH_HLEN + 16].copy_from_slice(&[10, 0, 0, 5]);
        frame[ETH_HLEN + 16..ETH_HLEN + 20].copy_from_slice(&[10, 0, 0, 9]);

        let original = frame.clone();
        dispatcher.dispatch(&mut frame);

        assert!(POOL_A.contains(&dst_of(&frame)));
        for (i, (&before, &after)) in original.iter().zip(frame.iter()).enumerate() {
            if !(IPV4_DST_OFF..IPV4_DST_OFF + 4).contains(&i) {
                assert_eq!(before, after, "byte {} changed", i);
            }
        }
    }

    #[test]
    fn same_flow_sticks_to_one_backend() {
        let control = control_for(&POOL_A);
        let mut dispatcher = Dispatcher::new(control, CacheConfig::default());

        let mut first = udp_frame([10, 0, 0, 5], [10, 0, 0, 9], 4444, 9000);
        dispatcher.dispatch(&mut first);
        let chosen = dst_of(&first);

        for _ in 0..32 {
            let mut frame = udp_frame([10, 0, 0, 5], [10, 0, 0, 9], 4444, 9000);
            dispatcher.dispatch(&mut frame);
            assert_eq!(dst_of(&frame), chosen);
        }
        assert_eq!(dispatcher.cache_misses(), 1);
        assert_eq!(dispatcher.cache_hits(), 32);
    }

    #[test]
    fn distinct_flows_use_the_cache_independently() {
        let control = control_for(&POOL_A);
        let mut dispatcher = Dispatcher::new(control, CacheConfig::default());

        let mut seen = std::collections::HashMap::new();
        for client in 1..=50u8 {
            let mut frame = udp_frame([10, 0, 0, client], [10, 0, 0, 9], 4444, 9000);
            dispatcher.dispatch(&mut frame);
            seen.insert(client, dst_of(&frame));
        }
        // Replaying every flow hits the cache and lands on the same backend.
        for client in 1..=50u8 {
            let mut frame = udp_frame([10, 0, 0, client], [10, 0, 0, 9], 4444, 9000);
            dispatcher.dispatch(&mut frame);
            assert_eq!(dst_of(&frame), seen[&client]);
        }
    }

    #[test]
    fn epoch_change_resets_stickiness() {
        let pool_b: [[u8; 4]; 2] = [[10, 2, 0, 1], [10, 2, 0, 2]];
        let control = control_for(&POOL_A);
        let mut dispatcher = Dispatcher::new(Arc::clone(&control), CacheConfig::default());

        let mut frame = udp_frame([10, 0, 0, 5], [10, 0, 0, 9], 4444, 9000);
        dispatcher.dispatch(&mut frame);
        assert!(POOL_A.contains(&dst_of(&frame)));

        // Install happens from another thread because it waits for this
        // dispatcher to observe the new epoch.
        let installer = {
            let control = Arc::clone(&control);
            let set = BackendSet::from_iter(pool_b.iter().map(|b| Ipv4Addr::from(*b)));
            std::thread::spawn(move || control.install(set))
        };
        while !installer.is_finished() {
            dispatcher.sync_epoch();
            std::thread::yield_now();
        }
        installer.join().unwrap().unwrap();

        let mut frame = udp_frame([10, 0, 0, 5], [10, 0, 0, 9], 4444, 9000);
        dispatcher.dispatch(&mut frame);
        assert!(pool_b.contains(&dst_of(&frame)), "flow still on old pool");
    }

    #[test]
    fn concurrent_workers_never_see_a_torn_epoch() {
        let pool_b: [[u8; 4]; 5] = [
            [10, 2, 0, 1],
            [10, 2, 0, 2],
            [10, 2, 0, 3],
            [10, 2, 0, 4],
            [10, 2, 0, 5],
        ];
        let control = control_for(&POOL_A);
        let stop = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..4)
            .map(|worker_id| {
                let control = Arc::clone(&control);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut dispatcher = Dispatcher::new(control, CacheConfig::default());
                    let mut client = worker_id as u8;
                    while !stop.load(Ordering::Relaxed) {
                        client = client.wrapping_add(1);
                        let mut frame =
                            udp_frame([10, 0, 0, client.max(1)], [10, 0, 0, 9], 4444, 9000);
                        dispatcher.dispatch(&mut frame);
                        let dst = dst_of(&frame);
                        assert!(
                            POOL_A.contains(&dst) || pool_b.contains(&dst),
                            "dst {:?} belongs to neither pool",
                            dst
                        );
                    }
                })
            })
            .collect();

        // Flip membership back and forth while the workers are steering.
        for round in 0..10 {
            let pool: Vec<Ipv4Addr> = if round % 2 == 0 {
                pool_b.iter().map(|b| Ipv4Addr::from(*b)).collect()
            } else {
                POOL_A.iter().map(|b| Ipv4Addr::from(*b)).collect()
            };
            control.install(BackendSet::from_iter(pool)).unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
