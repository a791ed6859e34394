/*
 * lib.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a resource-fetching engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! C FFI for corriere core. One download manager per process; sessions are identified by
//! the opaque id returned from corriere_session_new.
//! All string parameters are UTF-8 NUL-terminated.

use libc::{c_char, c_int, c_void, size_t};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::{Arc, RwLock};

use corriere_core::config::{EngineConfig, EngineInit};
use corriere_core::credentials::{default_credentials_path, CredentialPrompt, PromptOutcome};
use corriere_core::{ByteRange, DownloadManager, FetchError, Fetched, Session, SessionFlags, SessionState};

pub const CORRIERE_OK: c_int = 0;
pub const CORRIERE_ERROR: c_int = -1;

/// Results of corriere_session_fetch.
pub const CORRIERE_FETCH_DATA: c_int = 0;
pub const CORRIERE_FETCH_EMPTY: c_int = 1;
pub const CORRIERE_FETCH_FINISHED: c_int = 2;
pub const CORRIERE_FETCH_DISCONNECTED: c_int = 3;

pub const CORRIERE_FLAG_NOT_CACHED: u32 = SessionFlags::NOT_CACHED;
pub const CORRIERE_FLAG_MEMORY_CACHE: u32 = SessionFlags::MEMORY_CACHE;
pub const CORRIERE_FLAG_PERSISTENT: u32 = SessionFlags::PERSISTENT;
pub const CORRIERE_FLAG_ICY_METADATA: u32 = SessionFlags::ICY_METADATA;
pub const CORRIERE_FLAG_NO_PROXY: u32 = SessionFlags::NO_PROXY;
pub const CORRIERE_FLAG_HEAD_ONLY: u32 = SessionFlags::HEAD_ONLY;

struct SendableUserData(*mut c_void);
unsafe impl Send for SendableUserData {}
unsafe impl Sync for SendableUserData {}

/// (server, username or NULL, is_secure, user_data). Answer later with
/// corriere_credential_provide or corriere_credential_cancel.
type CredentialRequestCallback = extern "C" fn(*const c_char, *const c_char, c_int, *mut c_void);

type OnData = extern "C" fn(*const u8, size_t, *mut c_void);
/// (status: CORRIERE_OK or CORRIERE_ERROR, error message or NULL, user_data)
type OnComplete = extern "C" fn(c_int, *const c_char, *mut c_void);

/// Session progress, filled by corriere_session_get_stats.
#[repr(C)]
pub struct CorriereStats {
    pub bytes_done: u64,
    /// -1 while unknown.
    pub total: i64,
    pub bytes_per_sec: u64,
    /// 0 setup, 1 connected, 2 wait for reply, 3 data exchange, 4 transferred,
    /// 5 disconnected, 6 error.
    pub state: c_int,
}

type SessionSlot = Arc<tokio::sync::Mutex<Session>>;

/// Process-wide state: the runtime that drives all I/O, the manager and open sessions.
struct Registry {
    runtime: tokio::runtime::Runtime,
    manager: RwLock<Option<DownloadManager>>,
    sessions: RwLock<HashMap<u64, SessionSlot>>,
}

fn registry() -> Option<&'static Registry> {
    static REGISTRY: once_cell::sync::OnceCell<Registry> = once_cell::sync::OnceCell::new();
    REGISTRY
        .get_or_try_init(|| {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()?;
            Ok::<_, std::io::Error>(Registry {
                runtime,
                manager: RwLock::new(None),
                sessions: RwLock::new(HashMap::new()),
            })
        })
        .ok()
}

fn ptr_to_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string()) }
}

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error(msg: impl std::fmt::Display) {
    let msg = CString::new(msg.to_string()).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

fn manager() -> Option<DownloadManager> {
    let m = registry()?.manager.read().ok()?.clone();
    if m.is_none() {
        set_last_error("corriere_init has not been called");
    }
    m
}

fn session_slot(id: u64) -> Option<SessionSlot> {
    let slot = registry()?.sessions.read().ok()?.get(&id).cloned();
    if slot.is_none() {
        set_last_error("session not found");
    }
    slot
}

fn state_code(state: SessionState) -> c_int {
    state as c_int
}

/// Prompt that forwards to the C callback and waits for corriere_credential_provide.
struct CallbackPrompt {
    callback: CredentialRequestCallback,
    user_data: SendableUserData,
}

impl CredentialPrompt for CallbackPrompt {
    fn request(&self, server: &str, username: Option<&str>, secure: bool) -> PromptOutcome {
        let server_c = CString::new(server).unwrap_or_default();
        let user_c = username.map(|u| CString::new(u).unwrap_or_default());
        (self.callback)(
            server_c.as_ptr(),
            user_c.as_ref().map(|u| u.as_ptr()).unwrap_or(ptr::null()),
            if secure { 1 } else { 0 },
            self.user_data.0,
        );
        PromptOutcome::Pending
    }
}

#[no_mangle]
pub extern "C" fn corriere_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Last error message from a failed call on this thread. Valid until the next FFI call. Do not free.
#[no_mangle]
pub extern "C" fn corriere_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Free a string returned by this library. No-op if ptr is NULL.
#[no_mangle]
pub unsafe extern "C" fn corriere_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

/// Create the download manager. config_path may be NULL for the default location; a missing
/// file gives the defaults. Calling again replaces the manager (existing sessions keep the old one).
#[no_mangle]
pub unsafe extern "C" fn corriere_init(config_path: *const c_char) -> c_int {
    clear_last_error();
    corriere_core::logging::init("info");
    let Some(reg) = registry() else {
        set_last_error("failed to start runtime");
        return CORRIERE_ERROR;
    };
    let path = ptr_to_str(config_path)
        .map(std::path::PathBuf::from)
        .or_else(EngineConfig::default_path);
    let mut config = match path {
        Some(p) => match EngineConfig::load(&p) {
            Ok(c) => c,
            Err(e) => {
                set_last_error(e);
                return CORRIERE_ERROR;
            }
        },
        None => EngineConfig::default(),
    };
    if config.credentials_path.is_none() {
        config.credentials_path = default_credentials_path();
    }
    let _guard = reg.runtime.enter();
    match DownloadManager::new(config, EngineInit::global()) {
        Ok(m) => {
            if let Ok(mut slot) = reg.manager.write() {
                *slot = Some(m);
            }
            CORRIERE_OK
        }
        Err(e) => {
            set_last_error(e);
            CORRIERE_ERROR
        }
    }
}

/// Abort every session, free them and save credentials.
#[no_mangle]
pub extern "C" fn corriere_shutdown() {
    let Some(reg) = registry() else { return };
    let _guard = reg.runtime.enter();
    if let Ok(mut m) = reg.manager.write() {
        if let Some(m) = m.take() {
            m.shutdown();
        }
    }
    if let Ok(mut sessions) = reg.sessions.write() {
        sessions.clear();
    }
}

/// Aggregate rate cap over all sessions in bytes/s; 0 is unlimited.
#[no_mangle]
pub extern "C" fn corriere_set_max_rate(bytes_per_sec: u64) -> c_int {
    match manager() {
        Some(m) => {
            m.set_max_rate(bytes_per_sec);
            CORRIERE_OK
        }
        None => CORRIERE_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn corriere_aggregate_rate() -> u64 {
    manager().map(|m| m.aggregate_rate()).unwrap_or(0)
}

/// Send requests for this server (`scheme://host:port`) directly instead of through the proxy.
#[no_mangle]
pub unsafe extern "C" fn corriere_add_proxy_skip(server: *const c_char) -> c_int {
    let (Some(m), Some(server)) = (manager(), ptr_to_str(server)) else {
        return CORRIERE_ERROR;
    };
    m.add_proxy_skip(&server);
    CORRIERE_OK
}

/// Evict the disk cache down to its budget. Returns the remaining size, or -1.
#[no_mangle]
pub extern "C" fn corriere_cache_cleanup() -> i64 {
    let Some(m) = manager() else { return -1 };
    match m.cleanup_cache() {
        Ok(size) => size as i64,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// New session for url. range_start < 0 requests the whole resource; range_end < 0 leaves the
/// range open. Returns the session id, or 0 on error.
#[no_mangle]
pub unsafe extern "C" fn corriere_session_new(
    url: *const c_char,
    flags: u32,
    range_start: i64,
    range_end: i64,
) -> u64 {
    clear_last_error();
    let Some(m) = manager() else { return 0 };
    let Some(url) = ptr_to_str(url) else {
        set_last_error("url is null or not valid UTF-8");
        return 0;
    };
    let range = (range_start >= 0).then(|| {
        ByteRange::new(range_start as u64, (range_end >= 0).then_some(range_end as u64))
    });
    let Some(reg) = registry() else { return 0 };
    match m.create_session(&url, SessionFlags::from_bits(flags), range) {
        Ok(session) => {
            let id = session.id();
            if let Ok(mut sessions) = reg.sessions.write() {
                sessions.insert(id, Arc::new(tokio::sync::Mutex::new(session)));
            }
            id
        }
        Err(e) => {
            set_last_error(e);
            0
        }
    }
}

/// Add or replace a request header. Only effective before the first fetch.
#[no_mangle]
pub unsafe extern "C" fn corriere_session_set_header(
    id: u64,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    let (Some(slot), Some(name), Some(value)) = (session_slot(id), ptr_to_str(name), ptr_to_str(value)) else {
        return CORRIERE_ERROR;
    };
    let rc = match slot.try_lock() {
        Ok(mut s) => {
            s.set_header(&name, &value);
            CORRIERE_OK
        }
        Err(_) => {
            set_last_error("session is running");
            CORRIERE_ERROR
        }
    };
    rc
}

/// Per-session rate cap in bytes/s; 0 is unlimited.
#[no_mangle]
pub extern "C" fn corriere_session_set_max_rate(id: u64, bytes_per_sec: u64) -> c_int {
    match manager().and_then(|m| m.session(id)) {
        Some(s) => {
            s.set_max_rate(bytes_per_sec);
            CORRIERE_OK
        }
        None => {
            set_last_error("session not found");
            CORRIERE_ERROR
        }
    }
}

/// Poll the session. On CORRIERE_FETCH_DATA `*read` holds the byte count; on
/// CORRIERE_FETCH_EMPTY `*retry_ms` suggests when to poll again. Returns CORRIERE_ERROR
/// when the session failed (see corriere_last_error).
#[no_mangle]
pub unsafe extern "C" fn corriere_session_fetch(
    id: u64,
    buf: *mut u8,
    len: size_t,
    read: *mut size_t,
    retry_ms: *mut u32,
) -> c_int {
    clear_last_error();
    if buf.is_null() || len == 0 {
        set_last_error("buffer is null or empty");
        return CORRIERE_ERROR;
    }
    let (Some(reg), Some(slot)) = (registry(), session_slot(id)) else {
        return CORRIERE_ERROR;
    };
    let out = std::slice::from_raw_parts_mut(buf, len);
    let result = reg.runtime.block_on(async {
        let mut s = slot.lock().await;
        s.fetch(out).await
    });
    match result {
        Ok(Fetched::Data(n)) => {
            if !read.is_null() {
                *read = n;
            }
            CORRIERE_FETCH_DATA
        }
        Ok(Fetched::Empty { retry_in }) => {
            if !retry_ms.is_null() {
                *retry_ms = retry_in.as_millis().min(u32::MAX as u128) as u32;
            }
            CORRIERE_FETCH_EMPTY
        }
        Ok(Fetched::Finished) => CORRIERE_FETCH_FINISHED,
        Ok(Fetched::Disconnected) => CORRIERE_FETCH_DISCONNECTED,
        Err(e) => {
            set_last_error(e);
            CORRIERE_ERROR
        }
    }
}

/// Run the session on the runtime, delivering data through on_data and finishing with
/// on_complete. The session stays registered until corriere_session_free.
#[no_mangle]
pub unsafe extern "C" fn corriere_session_start(
    id: u64,
    on_data: OnData,
    on_complete: OnComplete,
    user_data: *mut c_void,
) -> c_int {
    let (Some(reg), Some(slot)) = (registry(), session_slot(id)) else {
        return CORRIERE_ERROR;
    };
    let ud = user_data as usize;
    reg.runtime.spawn(async move {
        let mut s = slot.lock().await;
        let result = s
            .run(|data| on_data(data.as_ptr(), data.len(), ud as *mut c_void))
            .await;
        match result {
            Ok(_) => on_complete(CORRIERE_OK, ptr::null(), ud as *mut c_void),
            Err(e) => complete_with_error(on_complete, &e, ud),
        }
    });
    CORRIERE_OK
}

fn complete_with_error(on_complete: OnComplete, e: &FetchError, ud: usize) {
    let msg = CString::new(e.to_string()).unwrap_or_default();
    on_complete(CORRIERE_ERROR, msg.as_ptr(), ud as *mut c_void);
}

#[no_mangle]
pub unsafe extern "C" fn corriere_session_get_stats(id: u64, out: *mut CorriereStats) -> c_int {
    if out.is_null() {
        set_last_error("out is null");
        return CORRIERE_ERROR;
    }
    let Some(stats) = manager().and_then(|m| m.session_stats(id)) else {
        set_last_error("session not found");
        return CORRIERE_ERROR;
    };
    *out = CorriereStats {
        bytes_done: stats.bytes_done,
        total: stats.total.map(|t| t as i64).unwrap_or(-1),
        bytes_per_sec: stats.bytes_per_sec,
        state: state_code(stats.state),
    };
    CORRIERE_OK
}

/// Ask the session to stop. Safe from any thread, including while it runs.
#[no_mangle]
pub extern "C" fn corriere_session_abort(id: u64) -> c_int {
    match manager() {
        Some(m) if m.abort_session(id) => CORRIERE_OK,
        Some(_) => {
            set_last_error("session not found");
            CORRIERE_ERROR
        }
        None => CORRIERE_ERROR,
    }
}

/// Release the session. A running session is aborted first.
#[no_mangle]
pub extern "C" fn corriere_session_free(id: u64) {
    let Some(reg) = registry() else { return };
    if let Some(m) = manager() {
        m.abort_session(id);
    }
    let _guard = reg.runtime.enter();
    if let Ok(mut sessions) = reg.sessions.write() {
        sessions.remove(&id);
    }
}

/// Set the credential request callback. Pass NULL to clear; requests are then denied.
#[no_mangle]
pub unsafe extern "C" fn corriere_set_credential_request_callback(
    callback: Option<CredentialRequestCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(m) = manager() else { return CORRIERE_ERROR };
    let prompt = callback.map(|cb| {
        Arc::new(CallbackPrompt {
            callback: cb,
            user_data: SendableUserData(user_data),
        }) as Arc<dyn CredentialPrompt>
    });
    m.set_credential_prompt(prompt);
    CORRIERE_OK
}

/// Answer a credential request. Waiting sessions retry with the new credentials.
#[no_mangle]
pub unsafe extern "C" fn corriere_credential_provide(
    server: *const c_char,
    username: *const c_char,
    password: *const c_char,
) -> c_int {
    let (Some(m), Some(server), Some(username), Some(password)) =
        (manager(), ptr_to_str(server), ptr_to_str(username), ptr_to_str(password))
    else {
        set_last_error("server, username or password missing");
        return CORRIERE_ERROR;
    };
    m.provide_credentials(&server, &username, &password);
    CORRIERE_OK
}

/// Decline a credential request; waiting sessions fail as unauthorized.
#[no_mangle]
pub unsafe extern "C" fn corriere_credential_cancel(server: *const c_char) -> c_int {
    let (Some(m), Some(server)) = (manager(), ptr_to_str(server)) else {
        return CORRIERE_ERROR;
    };
    m.deny_credentials(&server);
    CORRIERE_OK
}

/// Store credentials ahead of any request, and persist them.
#[no_mangle]
pub unsafe extern "C" fn corriere_credential_register(
    server: *const c_char,
    username: *const c_char,
    password: *const c_char,
) -> c_int {
    let (Some(m), Some(server), Some(username), Some(password)) =
        (manager(), ptr_to_str(server), ptr_to_str(username), ptr_to_str(password))
    else {
        set_last_error("server, username or password missing");
        return CORRIERE_ERROR;
    };
    m.register_credentials(&server, &username, &password);
    if let Err(e) = m.save_credentials() {
        set_last_error(e);
        return CORRIERE_ERROR;
    }
    CORRIERE_OK
}

/// Forget stored credentials for server (all users when username is NULL). Returns the count removed.
#[no_mangle]
pub unsafe extern "C" fn corriere_credential_forget(server: *const c_char, username: *const c_char) -> c_int {
    let (Some(m), Some(server)) = (manager(), ptr_to_str(server)) else {
        return CORRIERE_ERROR;
    };
    let n = m.forget_credentials(&server, ptr_to_str(username).as_deref());
    if let Err(e) = m.save_credentials() {
        set_last_error(e);
    }
    n as c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nul_terminated() {
        let v = unsafe { CStr::from_ptr(corriere_version()) };
        assert_eq!(v.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn calls_before_init_report_an_error() {
        if manager().is_some() {
            return;
        }
        assert_eq!(corriere_session_abort(42), CORRIERE_ERROR);
        assert!(!corriere_last_error().is_null());
    }

    #[test]
    fn flag_bits_match_core() {
        let flags = SessionFlags::from_bits(CORRIERE_FLAG_NOT_CACHED | CORRIERE_FLAG_HEAD_ONLY);
        assert!(flags.not_cached && flags.head_only);
        assert!(!flags.persistent);
    }

    #[test]
    fn state_codes_follow_declaration_order() {
        assert_eq!(state_code(SessionState::Setup), 0);
        assert_eq!(state_code(SessionState::DataExchange), 3);
        assert_eq!(state_code(SessionState::Error), 6);
    }
}
