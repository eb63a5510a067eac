//! Per-core packet steering workers.
//!
//! Each worker owns one dispatcher (and therefore one flow cache), polls an
//! AF_PACKET socket with recvmmsg for batches of IPv4 frames, rewrites the
//! destination address in place, and re-emits the frames on the same
//! interface. PACKET_FANOUT with hash mode plays the role of NIC RSS: the
//! kernel steers all packets of one flow to one worker's socket, so flow
//! stickiness holds without any cross-worker sharing.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use maglev_lb_core::dispatch::{Dispatcher, ETH_P_IP, MIN_FRAME_LEN};
use maglev_lb_core::{CacheConfig, RouterControl};
use tracing::{debug, error, info, warn};

use crate::config::Config;

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// Statistics aggregated across all steering workers.
#[derive(Debug, Default)]
pub struct DataplaneStats {
    pub pkts_received: AtomicU64,
    pub pkts_steered: AtomicU64,
    pub pkts_ignored: AtomicU64,
    pub pkts_tx_failed: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_steered: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

/// A running set of steering workers.
pub struct Dataplane {
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub stats: Arc<DataplaneStats>,
}

impl Dataplane {
    /// Start steering workers for the configured interface.
    pub fn start(config: &Config, control: Arc<RouterControl>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DataplaneStats::default());

        let interface = config.interface.clone();
        let cache_config = config.router.cache_config();
        let max_frame_size = config.dataplane.max_frame_size;
        let batch_size = config.dataplane.batch_size;
        let recv_buf_size = config.dataplane.recv_buf_size;

        // All workers of this process join one fanout group so the kernel
        // splits flows between their sockets.
        let fanout_group = (std::process::id() & 0xFFFF) as u16;

        let num_workers = match config.dataplane.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };

        info!(
            interface = %interface,
            backends = control.load().backends().len(),
            workers = num_workers,
            batch_size = batch_size,
            "starting dataplane"
        );

        let mut threads = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let control = control.clone();
            let interface = interface.clone();
            let pin_cpus = config.dataplane.pin_cpus;

            let handle = thread::Builder::new()
                .name(format!("steer-{}", worker_id))
                .spawn(move || {
                    if pin_cpus {
                        if let Some(core_id) = (core_affinity::CoreId { id: worker_id }).into() {
                            core_affinity::set_for_current(core_id);
                            debug!(worker = worker_id, core = worker_id, "pinned to CPU core");
                        }
                    }

                    if let Err(e) = worker_loop(
                        worker_id,
                        &interface,
                        control,
                        cache_config,
                        fanout_group,
                        max_frame_size,
                        batch_size,
                        recv_buf_size,
                        &shutdown,
                        &stats,
                    ) {
                        error!(worker = worker_id, error = %e, "worker exited with error");
                    }
                })
                .with_context(|| format!("spawning worker {}", worker_id))?;

            threads.push(handle);
        }

        Ok(Self {
            threads,
            shutdown,
            stats,
        })
    }

    /// Signal all workers to stop and wait for them to finish.
    pub fn shutdown(self) {
        info!("shutting down dataplane");
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker Loop
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_id: usize,
    interface: &str,
    control: Arc<RouterControl>,
    cache_config: CacheConfig,
    fanout_group: u16,
    max_frame_size: usize,
    batch_size: usize,
    recv_buf_size: usize,
    shutdown: &AtomicBool,
    stats: &DataplaneStats,
) -> Result<()> {
    let socket = create_packet_socket(interface, recv_buf_size, fanout_group)
        .with_context(|| format!("worker {}: creating packet socket", worker_id))?;
    let fd = socket.as_raw_fd();

    let mut dispatcher = Dispatcher::new(control, cache_config);

    // Buffers stay full-sized across batches; received lengths live in a
    // parallel array.
    let mut recv_bufs: Vec<Vec<u8>> = (0..batch_size)
        .map(|_| vec![0u8; max_frame_size])
        .collect();
    let mut frame_lens = vec![0usize; batch_size];

    info!(worker = worker_id, "entering steering loop");

    let mut last_heartbeat = Instant::now();
    let mut last_cache_hits = 0u64;
    let mut last_cache_misses = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        if last_heartbeat.elapsed() >= Duration::from_secs(5) {
            let hits = dispatcher.cache_hits();
            let misses = dispatcher.cache_misses();
            stats
                .cache_hits
                .fetch_add(hits - last_cache_hits, Ordering::Relaxed);
            stats
                .cache_misses
                .fetch_add(misses - last_cache_misses, Ordering::Relaxed);
            last_cache_hits = hits;
            last_cache_misses = misses;

            debug!(
                worker = worker_id,
                pkts_received = stats.pkts_received.load(Ordering::Relaxed),
                pkts_steered = stats.pkts_steered.load(Ordering::Relaxed),
                pkts_ignored = stats.pkts_ignored.load(Ordering::Relaxed),
                cache_hits = hits,
                cache_misses = misses,
                "worker heartbeat"
            );
            last_heartbeat = Instant::now();
        }

        let received = recv_batch(fd, &mut recv_bufs, &mut frame_lens)
            .with_context(|| format!("worker {}: receiving batch", worker_id))?;

        if received == 0 {
            // Keep acknowledging table installs while the link is quiet.
            dispatcher.sync_epoch();
            continue;
        }

        for (buf, &frame_len) in recv_bufs.iter_mut().zip(&frame_lens).take(received) {
            let frame = &mut buf[..frame_len];

            stats.pkts_received.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_received
                .fetch_add(frame_len as u64, Ordering::Relaxed);

            if frame_len < MIN_FRAME_LEN || !is_ipv4_frame(frame) {
                stats.pkts_ignored.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            dispatcher.dispatch(frame);

            match send_frame(fd, frame) {
                Ok(true) => {
                    stats.pkts_steered.fetch_add(1, Ordering::Relaxed);
                    stats
                        .bytes_steered
                        .fetch_add(frame_len as u64, Ordering::Relaxed);
                }
                Ok(false) => {
                    // Kernel TX buffer full (EAGAIN), count as failed.
                    stats.pkts_tx_failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(worker = worker_id, error = %e, "send error");
                    stats.pkts_tx_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    info!(worker = worker_id, "steering loop exited");
    Ok(())
}

#[inline]
fn is_ipv4_frame(frame: &[u8]) -> bool {
    u16::from_be_bytes([frame[12], frame[13]]) == ETH_P_IP
}

// ---------------------------------------------------------------------------
// Socket Creation
// ---------------------------------------------------------------------------

fn create_packet_socket(
    interface: &str,
    recv_buf_size: usize,
    fanout_group: u16,
) -> Result<socket2::Socket> {
    let protocol = (libc::ETH_P_IP as u16).to_be() as i32;

    let socket = socket2::Socket::new(
        socket2::Domain::PACKET,
        socket2::Type::RAW,
        Some(socket2::Protocol::from(protocol)),
    )
    .context("creating AF_PACKET socket")?;

    if recv_buf_size > 0 {
        socket
            .set_recv_buffer_size(recv_buf_size)
            .context("SO_RCVBUF")?;
    }

    // A read timeout so the loop can check the shutdown flag and
    // acknowledge table installs while idle.
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;

    let ifname = CString::new(interface).context("interface name")?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        bail!("interface '{}' not found", interface);
    }

    let fd = socket.as_raw_fd();

    // Bind to the interface so only its frames reach this socket.
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sll.sll_protocol = (libc::ETH_P_IP as u16).to_be();
    sll.sll_ifindex = ifindex as i32;

    let ret = unsafe {
        libc::bind(
            fd,
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("bind {}", interface));
    }

    // Receive frames addressed to the VIP, not just to this NIC's MAC.
    let mreq = libc::packet_mreq {
        mr_ifindex: ifindex as i32,
        mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error()).context("PACKET_ADD_MEMBERSHIP");
    }

    // Without this, frames we re-emit loop straight back into the capture
    // path: packet sockets see outgoing traffic too.
    let ignore_outgoing: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_IGNORE_OUTGOING,
            &ignore_outgoing as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error()).context("PACKET_IGNORE_OUTGOING");
    }

    // Hash fanout: each flow lands on exactly one worker's socket.
    let fanout: u32 = (fanout_group as u32) | ((libc::PACKET_FANOUT_HASH as u32) << 16);
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_FANOUT,
            &fanout as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error()).context("PACKET_FANOUT");
    }

    Ok(socket)
}

// ---------------------------------------------------------------------------
// Batched I/O
// ---------------------------------------------------------------------------

/// Pull one batch of frames off the socket with recvmmsg(2).
///
/// Each frame's length lands in `lens`, index-matched with `bufs`, which
/// are never resized. Returns the number of frames received, or 0 when the
/// socket read timed out.
fn recv_batch(fd: RawFd, bufs: &mut [Vec<u8>], lens: &mut [usize]) -> Result<usize> {
    let batch = bufs.len().min(lens.len());

    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(batch);
    for buf in bufs[..batch].iter_mut() {
        iovecs.push(libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        });
    }

    let mut headers: Vec<libc::mmsghdr> = Vec::with_capacity(batch);
    for iov in iovecs.iter_mut() {
        let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
        hdr.msg_hdr.msg_iov = iov;
        hdr.msg_hdr.msg_iovlen = 1;
        headers.push(hdr);
    }

    // MSG_WAITFORONE blocks for the first frame (bounded by the socket read
    // timeout), then drains whatever else is already queued.
    let received = unsafe {
        libc::recvmmsg(
            fd,
            headers.as_mut_ptr(),
            batch as libc::c_uint,
            libc::MSG_WAITFORONE,
            std::ptr::null_mut(),
        )
    };

    if received < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(0),
            _ => Err(err.into()),
        };
    }

    for (hdr, len) in headers.iter().zip(lens.iter_mut()).take(received as usize) {
        *len = hdr.msg_len as usize;
    }

    Ok(received as usize)
}

/// Re-emit one rewritten frame on the bound interface. `Ok(false)` means
/// the kernel TX queue was full (EAGAIN).
fn send_frame(fd: RawFd, frame: &[u8]) -> io::Result<bool> {
    let sent = unsafe { libc::send(fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
    if sent >= 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(false),
        _ => Err(err),
    }
}
