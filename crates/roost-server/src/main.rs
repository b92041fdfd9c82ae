use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roost_xmpp::beat::Heartbeat;
use roost_xmpp::comp::accept::{AcceptConfig, AcceptService};
use roost_xmpp::comp::connect::{ConnectConfig, ConnectService};
use roost_xmpp::logsink::LogSink;
use roost_xmpp::router::{Instance, InstanceKind, Router, RouterConfig};
use roost_xmpp::sm::modules::auth::AuthModule;
use roost_xmpp::sm::modules::disco::{BrowseModule, Directory, DiscoModule, ServiceEntry};
use roost_xmpp::sm::modules::offline::OfflineModule;
use roost_xmpp::sm::modules::presence::PresenceModule;
use roost_xmpp::sm::modules::private::PrivateModule;
use roost_xmpp::sm::modules::register::RegisterModule;
use roost_xmpp::sm::modules::roster::RosterModule;
use roost_xmpp::sm::modules::vcard::VcardModule;
use roost_xmpp::sm::modules::Module;
use roost_xmpp::sm::{SessionManager, SmConfig};
use roost_xmpp::xdb::backend::MemoryXdb;
use roost_xmpp::xdb::XdbCache;

mod config;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "roost-server", about = "Roost XMPP server", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Roost starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config_path = args.config.or_else(|| {
        std::env::var("ROOST_CONFIG").ok().map(PathBuf::from)
    });
    let config = Config::load(config_path.as_deref())?;
    config.log_config();

    let router = Router::new(RouterConfig {
        bounce_remote_not_found: config.router.bounce_remote_not_found,
    });
    let heartbeat = Arc::new(Heartbeat::new());

    // storage component
    let storage = Instance::new("xdb", InstanceKind::Xdb);
    MemoryXdb::new(router.clone()).attach(&storage);
    router.registry().set_default(Arc::clone(&storage));

    // log component
    let log = Instance::new("log", InstanceKind::Log);
    LogSink::new().attach(&log);
    router.registry().set_default(log);

    // session manager serving the configured domains
    let primary_host = config
        .server
        .hosts
        .first()
        .cloned()
        .unwrap_or_else(|| "localhost".to_string());
    let sm_instance = Instance::new(primary_host.clone(), InstanceKind::Normal);

    let xdb = XdbCache::new(router.clone(), primary_host.clone(), config.xdb_config());
    // the reply interceptor must be in place before any host registration
    xdb.attach(&sm_instance);
    xdb.register_sweep(&heartbeat);

    let directory = Directory {
        admins: config
            .directory
            .admins
            .iter()
            .filter_map(|admin| admin.parse().ok())
            .collect(),
        entries: config
            .directory
            .services
            .iter()
            .map(|service| ServiceEntry {
                jid: service.jid.clone(),
                name: service.name.clone(),
                category: service.category.clone(),
                service_type: service.service_type.clone(),
                admin_only: service.admin_only,
            })
            .collect(),
    };

    let modules: Vec<Arc<dyn Module>> = vec![
        RosterModule::new(),
        OfflineModule::new(),
        PresenceModule::new(),
        AuthModule::new(),
        RegisterModule::new(),
        DiscoModule::new(directory.clone()),
        BrowseModule::new(directory),
        PrivateModule::new(),
        VcardModule::new(),
    ];

    let sm = SessionManager::new(
        router.clone(),
        xdb.clone(),
        SmConfig {
            hosts: config.server.hosts.clone(),
            server_name: config.server.name.clone(),
            store_offline: config.server.store_offline.clone(),
        },
        modules,
    );
    sm.attach(&sm_instance);
    for host in &config.server.hosts {
        router.registry().register(host, Arc::clone(&sm_instance));
    }
    router.registry().set_default(sm_instance);

    // component links
    for section in &config.accept {
        let accept_config = AcceptConfig {
            queue_timeout: Duration::from_secs(section.queue_timeout_secs),
            handshake_timeout: Duration::from_secs(section.handshake_timeout_secs),
            ..AcceptConfig::new(
                section.id.clone(),
                section.bind.clone(),
                section.secret.clone(),
            )
        };
        let service = AcceptService::new(accept_config, router.clone(), Some(xdb.clone()));
        let instance = Instance::new(section.id.clone(), InstanceKind::Normal);
        service.attach(&instance);
        router.registry().register(&section.id, instance);
        service.register_sweep(&heartbeat);
        service.start().await?;
    }

    for section in &config.connect {
        let connect_config = ConnectConfig {
            queue_timeout: Duration::from_secs(section.queue_timeout_secs),
            reconnect: Duration::from_secs(section.reconnect_secs),
            ..ConnectConfig::new(
                section.id.clone(),
                section.addr.clone(),
                section.secret.clone(),
            )
        };
        let service = ConnectService::new(connect_config, router.clone(), Some(xdb.clone()));
        let instance = Instance::new(section.id.clone(), InstanceKind::Normal);
        service.attach(&instance);
        router.registry().register(&section.id, instance);
        service.register_sweep(&heartbeat);
        service.start();
    }

    info!("Roost running, ^C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    sm.shutdown().await;
    heartbeat.shutdown();
    Ok(())
}
