//! dnetd: a user-space DECnet Phase IV router.
//!
//! Everything protocol-shaped lives in the `dnet-*` crates; this binary
//! owns configuration, logging, the sockets, and the single-threaded
//! event loop that feeds the `Router`.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Context;

use async_io::Async;

use clap::Parser;

use embassy_futures::select::{select4, select_slice, Either4};
use embassy_time::{Instant, Timer};

use edge_nal::TcpAccept;
use edge_nal_std::Stack;

use futures_lite::future;

use log::{error, info, warn};

use dnet_packet::MacAddr;
use dnet_routing::{FatalError, NodeInfo, Router};

mod config;
mod dns;
mod lines;
mod raw_ether;

use config::Config;
use dns::DnsPoller;
use lines::{Line, LineBackend, ReadEvent};

#[derive(Parser)]
#[command(name = "dnetd", about = "User-space DECnet Phase IV router")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "dnetd.toml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            env_logger::Builder::new()
                .filter_level(log::LevelFilter::Info)
                .init();
            error!("{}", err);
            return ExitCode::from(1);
        }
    };

    init_logging(&config);

    match future::block_on(run(&config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Setup(err)) => {
            error!("{:#}", err);
            ExitCode::from(1)
        }
        Err(RunError::Fatal(err)) => {
            error!("{}", err);
            ExitCode::from(2)
        }
    }
}

fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    builder.parse_default_env();

    for (subsystem, level) in &config.logging {
        let Some(module) = config::subsystem_module(subsystem) else {
            eprintln!("unknown logging subsystem: {}", subsystem);
            continue;
        };

        if let Some(filter) = config::parse_log_level(level) {
            builder.filter_module(module, filter);
        }
    }

    builder.init();
}

enum RunError {
    Setup(anyhow::Error),
    Fatal(FatalError),
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        Self::Setup(err)
    }
}

impl From<FatalError> for RunError {
    fn from(err: FatalError) -> Self {
        Self::Fatal(err)
    }
}

async fn run(config: &Config) -> Result<(), RunError> {
    let stack = Stack::new();

    let address = config.node_address().map_err(anyhow::Error::from)?;
    let mut name = heapless::String::new();
    let _ = name.push_str(&config.node.name);

    let mut router = Box::new(Router::new(NodeInfo {
        address,
        name,
        level: config.level(),
        priority: config.node.priority,
    }));

    let own_mac = address.mac();
    let mut lines: Vec<Line> = Vec::new();

    for section in &config.ethernet {
        let slot = router
            .add_ethernet_circuit(&section.interface, section.cost)
            .context("too many circuits")?;

        info!("Ethernet interface is: {}", section.interface);

        let ethernet = raw_ether::RawEthernet::open(&section.interface)
            .with_context(|| format!("opening interface {}", section.interface))?;

        lines.push(Line::new(slot, LineBackend::EthernetRaw(ethernet)));
    }

    for section in &config.bridge {
        let (host, dest_port) = config::split_host_port(&section.address).map_err(anyhow::Error::from)?;

        let slot = router
            .add_ethernet_circuit(&format!("bridge-{}", host), section.cost)
            .context("too many circuits")?;

        info!(
            "bridge interface sends to {}:{} and listens on {}",
            host, dest_port, section.port
        );

        let socket = lines::bind_bridge(&stack, section.port)
            .await
            .context("binding bridge socket")?;

        lines.push(Line::new(
            slot,
            LineBackend::EthernetBridge {
                socket,
                host: host.to_string(),
                port: dest_port,
                peer: None,
            },
        ));
    }

    for section in &config.ddcmp {
        let slot = router
            .add_ddcmp_circuit(&format!("ddcmp-{}", section.address), section.cost)
            .context("too many circuits")?;

        info!("DDCMP interface expecting connections from {}", section.address);

        lines.push(Line::new(
            slot,
            LineBackend::DdcmpTcp {
                stream: None,
                host: section.address.clone(),
                peer: None,
            },
        ));
    }

    let listener = match &config.socket {
        Some(socket) => {
            use edge_nal::TcpBind;

            info!("TCP listening on port {}", socket.tcp_listen_port);

            let acceptor = stack
                .bind(std::net::SocketAddr::new(
                    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    socket.tcp_listen_port,
                ))
                .await
                .context("binding TCP listener")?;

            Some(acceptor)
        }
        None => None,
    };

    let shutdown = signal_pipe().context("installing signal handler")?;

    dns::resolve_initial(&stack, &mut lines).await;

    let mut dns_poller = config
        .dns
        .as_ref()
        .map(|section| DnsPoller::new(&section.address, section.poll, Instant::now()));

    let now = Instant::now();
    router.start(now);

    for line in &lines {
        if !matches!(line.backend, LineBackend::DdcmpTcp { .. }) {
            router.on_ethernet_line_up(line.slot, now)?;
        }
    }

    info!("main loop start");

    loop {
        // No transport layer rides on this router; traffic for this
        // node terminates here.
        while let Some(packet) = router.take_local_packet() {
            info!(
                "packet from {} for this node ({} bytes), no transport layer configured",
                packet.src,
                packet.data.len()
            );
        }

        flush_output(&mut router, &mut lines, &own_mac, Instant::now()).await;

        let due = [
            router.next_due(),
            dns_poller.as_ref().map(|poller| poller.next_due()),
        ]
        .into_iter()
        .flatten()
        .min();

        let timer = async {
            match due {
                Some(at) => Timer::at(at).await,
                None => future::pending().await,
            }
        };

        let accept = async {
            match &listener {
                Some(listener) => listener.accept().await,
                None => future::pending().await,
            }
        };

        let stop = wait_signal(&shutdown);

        type ReadFuture<'a> =
            Pin<Box<dyn std::future::Future<Output = (usize, std::io::Result<ReadEvent>)> + 'a>>;

        let mut reads: Vec<ReadFuture<'_>> = lines
            .iter_mut()
            .map(|line| {
                let fut: ReadFuture<'_> = Box::pin(async move {
                    let slot = line.slot;
                    (slot, line.read().await)
                });
                fut
            })
            .collect();

        let event = select4(timer, select_slice(Pin::new(&mut reads[..])), accept, stop).await;
        drop(reads);

        let now = Instant::now();

        match event {
            Either4::First(()) => {
                router.on_tick(now)?;

                if let Some(poller) = &mut dns_poller {
                    if poller.is_due(now) {
                        poller.poll(&stack, &mut lines, now).await;
                    }
                }
            }
            Either4::Second(((slot, result), index)) => match result {
                Ok(ReadEvent::Frame(len)) => {
                    let data = lines[index].buf[..len].to_vec();
                    router.on_ethernet_frame(slot, &data, now)?;
                }
                Ok(ReadEvent::Bytes(len)) => {
                    let data = lines[index].buf[..len].to_vec();
                    router.on_ddcmp_data(slot, &data, now)?;
                }
                Ok(ReadEvent::Closed) => {
                    lines[index].detach_stream();
                    router.on_ddcmp_disconnected(slot, now)?;
                }
                Err(err) => {
                    warn!("read error on circuit {}: {}", slot, err);

                    if matches!(lines[index].backend, LineBackend::DdcmpTcp { .. }) {
                        lines[index].detach_stream();
                        router.on_ddcmp_disconnected(slot, now)?;
                    }
                }
            },
            Either4::Third(accepted) => match accepted {
                Ok((remote, socket)) => {
                    let line = lines
                        .iter_mut()
                        .find(|line| line.expects_peer(&remote));

                    match line {
                        Some(line) => {
                            if line.attach_stream(remote, socket) {
                                router.on_ddcmp_connected(line.slot, now)?;
                            }
                        }
                        None => {
                            info!("cannot find DDCMP circuit for connection from {}", remote);
                        }
                    }
                }
                Err(err) => warn!("accept failed: {}", err),
            },
            Either4::Fourth(()) => {
                info!("shutdown requested");
                break;
            }
        }
    }

    info!("main loop terminated");

    let now = Instant::now();
    router.stop(now);
    flush_output(&mut router, &mut lines, &own_mac, now).await;

    Ok(())
}

/// Pushes everything the router queued onto the wire: framed packets on
/// broadcast lines, protocol bytes on point-to-point streams.
async fn flush_output(router: &mut Router, lines: &mut [Line], own_mac: &MacAddr, now: Instant) {
    for line in lines {
        let slot = line.slot;

        match line.backend {
            LineBackend::EthernetRaw(_) | LineBackend::EthernetBridge { .. } => {
                while let Some(out) = router.take_outbound(slot) {
                    line.send_frame(&out.dst.mac(), own_mac, &out.data).await;
                }
            }
            LineBackend::DdcmpTcp { .. } => loop {
                let pending = match router.ddcmp_line_mut(slot) {
                    Some(ddcmp) => ddcmp.pending_output().to_vec(),
                    None => break,
                };

                if pending.is_empty() {
                    break;
                }

                match line.send_stream(&pending).await {
                    Ok(()) => {
                        if let Some(ddcmp) = router.ddcmp_line_mut(slot) {
                            ddcmp.consume_output(pending.len());
                        }
                    }
                    Err(err) => {
                        warn!("write error on circuit {}: {}", slot, err);
                        line.detach_stream();
                        let _ = router.on_ddcmp_disconnected(slot, now);
                        break;
                    }
                }
            },
        }
    }
}

static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(_signal: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"x".as_ptr() as *const _, 1);
        }
    }
}

/// SIGINT/SIGTERM wake the event loop through a pipe so shutdown runs
/// on the loop, not in the handler.
fn signal_pipe() -> std::io::Result<Async<File>> {
    let mut fds = [0 as libc::c_int; 2];

    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    SIGNAL_FD.store(fds[1], Ordering::Relaxed);

    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;

    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    Ok(Async::new(unsafe { File::from_raw_fd(fds[0]) })?)
}

async fn wait_signal(pipe: &Async<File>) {
    let mut byte = [0u8; 1];

    let _ = pipe
        .read_with(|file| {
            let ret = unsafe {
                libc::read(file.as_raw_fd(), byte.as_mut_ptr() as *mut _, 1)
            };

            if ret == -1 {
                Err(std::io::Error::last_os_error())
            } else if ret == 0 {
                Err(std::io::ErrorKind::WouldBlock.into())
            } else {
                Ok(())
            }
        })
        .await;
}
