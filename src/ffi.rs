use std::os::raw::{c_char, c_int, c_ushort};

fn result_to_c_string(result: crate::Result<()>) -> *mut c_char {
    let message = match result {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    };
    match std::ffi::CString::new(message) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn install_logger() {
    log::set_max_level(log::LevelFilter::Info);
    if let Err(err) = log::set_boxed_logger(Box::<crate::dump_logger::DumpLogger>::default()) {
        log::debug!("set logger error: {err}");
    }
}

/// # Safety
///
/// Start the TUN data plane.
/// Parameters:
/// - tun_fd: a valid, non-blocking TUN descriptor owned by the host
/// - mtu: the device MTU, within [576, 65535]
/// - config_json: node configuration JSON
///
/// Returns an empty string on success, the error message otherwise;
/// release it with `mandala_string_free`. A running instance is stopped
/// before the new one starts.
#[cfg(unix)]
#[no_mangle]
pub unsafe extern "C" fn mandala_start_vpn(
    tun_fd: c_int,
    mtu: c_ushort,
    config_json: *const c_char,
) -> *mut c_char {
    install_logger();
    let Ok(config_json) = std::ffi::CStr::from_ptr(config_json).to_str() else {
        return result_to_c_string(Err(crate::Error::Config("config is not utf-8".into())));
    };
    result_to_c_string(crate::api::start_vpn(tun_fd, mtu, config_json))
}

/// # Safety
///
/// Start the local SOCKS5/HTTP inbound on 127.0.0.1:`local_port` using
/// the same outbound pipeline. Same return convention as
/// `mandala_start_vpn`.
#[no_mangle]
pub unsafe extern "C" fn mandala_start(local_port: c_ushort, config_json: *const c_char) -> *mut c_char {
    install_logger();
    let Ok(config_json) = std::ffi::CStr::from_ptr(config_json).to_str() else {
        return result_to_c_string(Err(crate::Error::Config("config is not utf-8".into())));
    };
    result_to_c_string(crate::api::start(local_port, config_json))
}

/// Idempotent teardown of every running instance.
#[no_mangle]
pub extern "C" fn mandala_stop() {
    crate::api::stop();
}

/// True iff a TUN or local instance exists.
#[no_mangle]
pub extern "C" fn mandala_is_running() -> bool {
    crate::api::is_running()
}

/// # Safety
///
/// Free a string returned by this library. Accepts null.
#[no_mangle]
pub unsafe extern "C" fn mandala_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(std::ffi::CString::from_raw(s));
    }
}
