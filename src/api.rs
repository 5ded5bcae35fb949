use crate::{config::NodeConfig, Error, Result};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Bounded teardown of a stopped instance's runtime; together with the
/// run loop's 100 ms grace this keeps a full stop under half a second.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(300);

struct Instance {
    token: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

static TUN_INSTANCE: Mutex<Option<Instance>> = Mutex::new(None);
static LOCAL_INSTANCE: Mutex<Option<Instance>> = Mutex::new(None);

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Stack(format!("runtime: {e}")))
}

/// Take over a platform-owned TUN descriptor and run the data plane on
/// it. A still-running TUN instance is stopped first; any error leaves
/// no instance behind.
#[cfg(unix)]
pub fn start_vpn(tun_fd: i32, mtu: u16, config_json: &str) -> Result<()> {
    stop_instance(&TUN_INSTANCE);

    let node = Arc::new(NodeConfig::from_json(config_json)?);
    let rt = build_runtime()?;
    let device = {
        let _enter = rt.enter();
        crate::device::open(tun_fd, mtu)?
    };

    let token = CancellationToken::new();
    let run_token = token.clone();
    let thread = std::thread::Builder::new()
        .name("mandala-tun".into())
        .spawn(move || {
            if let Err(e) = rt.block_on(crate::stack::run(device, mtu, node, run_token)) {
                log::error!("[STACK] run loop failed: {e}");
            }
            rt.shutdown_timeout(SHUTDOWN_TIMEOUT);
        })
        .map_err(|e| Error::Stack(format!("spawn run thread: {e}")))?;

    *TUN_INSTANCE.lock().unwrap() = Some(Instance {
        token,
        thread: Some(thread),
    });
    Ok(())
}

/// Alternative inbound: a SOCKS5/HTTP listener on 127.0.0.1 feeding the
/// same outbound pipeline.
pub fn start(local_port: u16, config_json: &str) -> Result<()> {
    stop_instance(&LOCAL_INSTANCE);

    let node = Arc::new(NodeConfig::from_json(config_json)?);
    let rt = build_runtime()?;
    let listener = rt
        .block_on(tokio::net::TcpListener::bind(("127.0.0.1", local_port)))
        .map_err(|e| Error::Stack(format!("bind 127.0.0.1:{local_port}: {e}")))?;
    log::info!("[LOCAL] listening on 127.0.0.1:{local_port}");

    let token = CancellationToken::new();
    let run_token = token.clone();
    let thread = std::thread::Builder::new()
        .name("mandala-local".into())
        .spawn(move || {
            if let Err(e) = rt.block_on(crate::local::run(listener, node, run_token)) {
                log::error!("[LOCAL] run loop failed: {e}");
            }
            rt.shutdown_timeout(SHUTDOWN_TIMEOUT);
        })
        .map_err(|e| Error::Stack(format!("spawn run thread: {e}")))?;

    *LOCAL_INSTANCE.lock().unwrap() = Some(Instance {
        token,
        thread: Some(thread),
    });
    Ok(())
}

fn stop_instance(slot: &Mutex<Option<Instance>>) {
    let instance = slot.lock().unwrap().take();
    if let Some(mut instance) = instance {
        instance.token.cancel();
        if let Some(thread) = instance.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Idempotent teardown of whatever is running.
pub fn stop() {
    stop_instance(&TUN_INSTANCE);
    stop_instance(&LOCAL_INSTANCE);
}

/// True iff a TUN or local instance exists.
pub fn is_running() -> bool {
    TUN_INSTANCE.lock().unwrap().is_some() || LOCAL_INSTANCE.lock().unwrap().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[serial]
    #[test]
    fn stop_without_start_is_a_no_op() {
        stop();
        stop();
        assert!(!is_running());
    }

    #[serial]
    #[test]
    fn local_instance_lifecycle() {
        let json = r#"{"type":"trojan","server":"127.0.0.1","server_port":9,"password":"p"}"#;
        start(0, json).unwrap();
        assert!(is_running());
        // start() replaces a running local instance instead of stacking.
        start(0, json).unwrap();
        assert!(is_running());
        stop();
        assert!(!is_running());
        stop();
    }

    #[cfg(unix)]
    #[serial]
    #[test]
    fn start_vpn_with_bad_fd_leaves_nothing_running() {
        let json = r#"{"type":"trojan","server":"127.0.0.1","server_port":9,"password":"p"}"#;
        assert!(start_vpn(-1, 1500, json).is_err());
        assert!(!is_running());
    }

    #[serial]
    #[test]
    fn start_vpn_rejects_bad_config() {
        #[cfg(unix)]
        {
            assert!(matches!(
                start_vpn(0, 1500, "{not json"),
                Err(Error::Config(_))
            ));
            assert!(!is_running());
        }
    }
}
