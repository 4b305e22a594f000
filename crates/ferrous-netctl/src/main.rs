mod tunnel;

use std::error::Error;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ferrous_net::{
    Clock, IfaceId, MacAddr, NetConfig, NetError, NetInterface, NetStack, SocketHandle,
    SystemClock,
};
use log::{debug, info};

use crate::tunnel::TunnelDevice;

const IDLE: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LinkArgs {
    /// Local UDP endpoint of the tunnel
    #[arg(long, default_value = "127.0.0.1:5555")]
    bind: String,

    /// Far end of the tunnel
    #[arg(long, default_value = "127.0.0.1:5556")]
    remote: String,

    /// Interface MAC address
    #[arg(long, default_value_t = MacAddr::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]))]
    mac: MacAddr,

    /// Static address; without it the interface is configured by DHCP
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    #[arg(long, default_value_t = Ipv4Addr::new(255, 255, 255, 0))]
    netmask: Ipv4Addr,

    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    gateway: Ipv4Addr,

    /// DNS server (overrides the one learned from DHCP)
    #[arg(long)]
    dns: Option<Ipv4Addr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send ICMP echo requests
    Ping {
        /// Host name or dotted quad
        host: String,

        #[arg(short, long, default_value_t = 4)]
        count: u32,
    },
    /// Look up an A record
    Resolve { name: String },
    /// Acquire a DHCP lease and print it
    Dhcp {
        /// Give the lease back before exiting
        #[arg(long)]
        release: bool,
    },
    /// TCP echo server, one connection at a time
    Serve {
        #[arg(short, long, default_value_t = 7)]
        port: u16,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    if matches!(cli.command, Commands::Dhcp { .. }) && cli.link.ip.is_some() {
        return Err("--ip conflicts with dhcp".into());
    }
    let (mut stack, eth0) = bring_up(&cli.link)?;

    match cli.command {
        Commands::Ping { host, count } => ping(&mut stack, &host, count),
        Commands::Resolve { name } => {
            let ip = stack.dns_resolve(&name)?;
            println!("{} has address {}", name, ip);
            Ok(())
        }
        Commands::Dhcp { release } => {
            if let Some(nic) = stack.interface(eth0) {
                println!("{}: {}/{} gw {}", nic.name, nic.ip, nic.netmask, nic.gateway);
            }
            if let Some(lease) = stack.dhcp_client().lease {
                println!(
                    "lease from {}: {} seconds, dns {}",
                    lease.server, lease.lease_secs, lease.dns
                );
            }
            if release {
                stack.dhcp_release()?;
                println!("released");
            }
            Ok(())
        }
        Commands::Serve { port } => serve(&mut stack, port),
    }
}

/// Open the tunnel, register it as `eth0` and configure it statically or
/// through DHCP.
fn bring_up(link: &LinkArgs) -> Result<(NetStack, IfaceId), Box<dyn Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let mut stack = NetStack::new(NetConfig::default(), clock);

    let device = TunnelDevice::open(&link.bind, &link.remote)?;
    let receiver = device.receiver()?;
    let eth0 = stack.add_interface(NetInterface::new("eth0", link.mac, Box::new(device)))?;
    receiver.spawn(stack.frame_sender(), eth0)?;

    match link.ip {
        Some(ip) => stack.configure_interface(eth0, ip, link.netmask, link.gateway)?,
        None => {
            info!("eth0: no static address, asking DHCP");
            let lease = stack.dhcp_acquire(eth0)?;
            debug!("eth0: leased {} for {}s", lease.ip, lease.lease_secs);
        }
    }
    if let Some(dns) = link.dns {
        stack.dns_set_server(dns);
    }
    Ok((stack, eth0))
}

fn ping(stack: &mut NetStack, host: &str, count: u32) -> Result<(), Box<dyn Error>> {
    for seq in 0..count {
        match stack.ping(host) {
            Ok(rtt) => println!(
                "reply from {}: seq={} time={}ms",
                stack.ping_state().dest,
                seq,
                rtt.as_millis()
            ),
            Err(NetError::TimedOut) => println!("request timeout for seq={}", seq),
            Err(e) => return Err(e.into()),
        }
        if seq + 1 < count {
            stack.clock().idle(Duration::from_secs(1));
        }
    }
    let stats = stack.ping_get_stats();
    println!(
        "--- {} ping statistics ---\n{} transmitted, {} received",
        host, stats.sent, stats.received
    );
    Ok(())
}

/// Accept, echo until the peer closes, then re-arm the listener for the
/// next client.
fn serve(stack: &mut NetStack, port: u16) -> Result<(), Box<dyn Error>> {
    let listener = stack.tcp_listen(port)?;
    println!("listening on port {}", port);
    loop {
        stack.poll();
        match stack.tcp_accept(listener) {
            Ok(conn) => {
                let echoed = echo(stack, conn)?;
                println!("connection closed after {} bytes", echoed);
                stack.tcp_close(listener)?;
            }
            Err(NetError::WouldBlock) => stack.clock().idle(IDLE),
            Err(e) => return Err(e.into()),
        }
    }
}

fn echo(stack: &mut NetStack, conn: SocketHandle) -> Result<usize, NetError> {
    let mut buf = [0u8; 1024];
    let mut total = 0;
    loop {
        stack.poll();
        match stack.tcp_recv(conn, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                stack.tcp_send(conn, &buf[..n])?;
                total += n;
            }
            Err(NetError::WouldBlock) => stack.clock().idle(IDLE),
            Err(NetError::ConnectionReset) => {
                info!("serve: connection reset");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    stack.tcp_close(conn)?;
    Ok(total)
}
