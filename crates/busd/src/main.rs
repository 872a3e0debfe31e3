mod event_loop;
mod transport;

use std::time::Duration;

use bus_core::config::BusConfig;
use bus_core::Message;
use bus_engine::{ConnId, Context, Dispatcher};

use event_loop::EventLoop;
use transport::Listener;

/// Policy hook backed by `BusConfig::policy`. `allow_all` is accepted
/// by the config format and carried here for when a real allow-list
/// lands, but nothing reads it yet: every send is allowed, same as
/// `AllowAll`, regardless of what the field is set to.
struct ConfiguredPolicy {
    #[allow(dead_code)]
    allow_all: bool,
}

impl Context for ConfiguredPolicy {
    fn check_policy(&self, _sender: ConnId, _destination: Option<ConnId>, _message: &Message) -> bool {
        true
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = BusConfig::load()?;
    tracing::info!(
        socket = %config.listen.socket_path.display(),
        "busd starting"
    );

    let listener = Listener::bind(&config.listen.socket_path)?;
    let dispatcher = Dispatcher::new(config.limits.max_match_rules);
    let ctx: Box<dyn Context> = Box::new(ConfiguredPolicy {
        allow_all: config.policy.allow_all,
    });
    let mut event_loop = EventLoop::new(
        listener,
        dispatcher,
        ctx,
        Duration::from_millis(config.limits.oom_retry_interval_ms),
        config.limits.max_outgoing_bytes,
    );

    event_loop.run();
    Ok(())
}
