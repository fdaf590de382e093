pub mod bus;
pub mod config;
pub mod observer;
pub mod proto;
pub mod server;
pub mod statistics;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use service::{AcceptorConfig, Service, ServiceOptions, VhostConfig};

use self::{
    bus::BusSender, config::Config, observer::Observer, server::Exchanger, statistics::Statistics,
};

#[rustfmt::skip]
pub(crate) static SOFTWARE: &str = concat!(
    "gateway-server.",
    env!("CARGO_PKG_VERSION")
);

/// Shared handles threaded through every connection and bus task.
///
/// There is no ambient global state: everything a callback needs travels in
/// one of these.
#[derive(Clone)]
pub struct Gateway {
    pub service: Arc<Service<Observer>>,
    pub exchanger: Exchanger,
    pub bus: BusSender,
    pub statistics: Statistics,
    pub max_hops: u32,
}

/// In order to let the integration tests use the gateway-server crate and
/// start the server directly, a function is opened to replace the main
/// function.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    log::info!("*** starting {SOFTWARE} ***");

    validate(&config)?;

    // The descriptor budget bounds how many connections this process can
    // take; query it up front so the limit is visible in the logs.
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => log::info!("max file descriptors: {soft}"),
        Err(e) => bail!("unable to get the maximum file descriptor number: getrlimit(): {e}"),
    }

    let statistics = Statistics::default();
    let (bus, egress) = bus::channel();

    let service = Service::new(ServiceOptions {
        sht_size: config.runtime.sht_size,
        ping_freq: config.runtime.ping_freq.ceil() as u64,
        session_timeout: config.runtime.session_timeout,
        acceptors: config
            .bind
            .iter()
            .map(|it| AcceptorConfig {
                name: it.name(),
                shared: it.shared,
            })
            .collect(),
        vhosts: config
            .vhost
            .iter()
            .map(|it| VhostConfig {
                name: it.name.clone(),
                dealers: it.dealers.clone(),
                acceptors: it.binds.clone(),
            })
            .collect(),
        handler: Observer::new(bus.clone()),
    });

    service.fixup();

    let gateway = Gateway {
        service,
        exchanger: Exchanger::default(),
        bus,
        statistics,
        max_hops: config.runtime.max_hops,
    };

    bus::start(&config, gateway.clone(), egress).await?;
    server::start(&config, &gateway).await?;

    // Sockets are bound, root is no longer needed.
    drop_privileges(&config)?;

    tokio::spawn(bus::pinger::start(gateway.clone(), config.runtime.ping_freq));
    tokio::spawn(report_stats(gateway.clone()));

    log::info!("*** {SOFTWARE} is ready ***");

    std::future::pending::<()>().await;
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.bind.is_empty() {
        bail!("config error: please specify at least one 'bind' entry");
    }

    for vhost in &config.vhost {
        if vhost.dealers.is_empty() {
            bail!("config error: vhost {:?} declares no dealers", vhost.name);
        }

        for bind in &vhost.binds {
            if !config.bind.iter().any(|it| it.name() == *bind) {
                bail!(
                    "config error: vhost {:?} binds unknown acceptor {:?}",
                    vhost.name,
                    bind
                );
            }
        }
    }

    Ok(())
}

async fn report_stats(gateway: Gateway) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));

    // the first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;

        log::info!(
            "active sessions: {}, connections: {}, frames: in={}, out={}, dropped={}, failed={}",
            gateway.service.active_sessions(),
            gateway.statistics.connections.get(),
            gateway.statistics.frames_in.get(),
            gateway.statistics.frames_out.get(),
            gateway.statistics.frames_dropped.get(),
            gateway.statistics.send_failures.get(),
        );
    }
}

fn drop_privileges(config: &Config) -> Result<()> {
    use nix::unistd::{Gid, Group, Uid, User, getegid, geteuid, setgid, setuid};

    if !geteuid().is_root() {
        log::info!("uid: {}, gid: {}", geteuid(), getegid());
        return Ok(());
    }

    // setgid first, setuid would take the right to do so away.
    let gid = match Group::from_name(&config.identity.gid)? {
        Some(group) => group.gid,
        None => Gid::from_raw(
            config
                .identity
                .gid
                .parse()
                .context("unable to drop privileges: unknown group")?,
        ),
    };

    setgid(gid).context("unable to drop privileges: setgid()")?;

    let uid = match User::from_name(&config.identity.uid)? {
        Some(user) => user.uid,
        None => Uid::from_raw(
            config
                .identity
                .uid
                .parse()
                .context("unable to drop privileges: unknown user")?,
        ),
    };

    setuid(uid).context("unable to drop privileges: setuid()")?;

    log::info!("uid: {uid}, gid: {gid}");
    Ok(())
}
