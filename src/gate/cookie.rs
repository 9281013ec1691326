//! Split gates for wrappers around foreign functions.
//!
//! [`callgate_enter`] grants the target compartment's rights in addition to
//! the caller's and hands out a cookie; the wrapper runs the callee through
//! [`CallgateCookie::run`] and finishes with [`callgate_exit`], which restores
//! exactly the state recorded at entry.

use std::marker::PhantomData;

use crate::compartment::CompartmentId;
use crate::hardware::Pkru;
use crate::runtime::context::with_context;
use crate::runtime::{Runtime, fatal};

/// State saved by [`callgate_enter`]. Bound to the entering thread.
#[derive(Debug)]
#[must_use = "pass the cookie to `callgate_exit`"]
pub struct CallgateCookie {
    compartment: CompartmentId,
    symbol: &'static str,
    saved_pkru: Pkru,
    saved_slot: usize,
    _not_send: PhantomData<*const ()>,
}

fn uninitialized_stack(symbol: &'static str, compartment: CompartmentId) -> ! {
    tracing::error!(symbol, %compartment, "callgate entered before its stack exists");
    std::process::abort()
}

/// Open a gate into `compartment` for the wrapper of `symbol`.
///
/// Entering a compartment whose stack is not set up on this thread aborts.
pub fn callgate_enter(compartment: CompartmentId, symbol: &'static str) -> CallgateCookie {
    let rt = Runtime::global().unwrap_or_else(|e| fatal(e));
    let cookie = with_context(rt, |ctx| {
        if ctx.stack(compartment).is_none() || ctx.slot(compartment).get() == 0 {
            uninitialized_stack(symbol, compartment);
        }
        let hw = rt.hardware();
        let saved_pkru = hw.read_pkru();
        // Safety: the union keeps the caller's own key, and with it the
        // current stack, accessible.
        unsafe { hw.write_pkru(saved_pkru.union(compartment.pkru())) };
        CallgateCookie {
            compartment,
            symbol,
            saved_pkru,
            saved_slot: ctx.slot(compartment).get(),
            _not_send: PhantomData,
        }
    });
    let cookie = cookie.unwrap_or_else(|e| fatal(e));
    tracing::trace!(symbol, compartment = %cookie.compartment, "callgate enter");
    cookie
}

/// Close the gate opened by `cookie`.
pub fn callgate_exit(cookie: CallgateCookie) {
    let rt = Runtime::global().unwrap_or_else(|e| fatal(e));
    let restored = with_context(rt, |ctx| {
        ctx.slot(cookie.compartment).set(cookie.saved_slot);
        // Safety: restores the value read at entry on this same thread.
        unsafe { rt.hardware().write_pkru(cookie.saved_pkru) };
    });
    restored.unwrap_or_else(|e| fatal(e));
    tracing::trace!(symbol = cookie.symbol, "callgate exit");
}

impl CallgateCookie {
    pub fn compartment(&self) -> CompartmentId {
        self.compartment
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    pub fn saved_pkru(&self) -> Pkru {
        self.saved_pkru
    }

    /// Run the callee on the compartment's stack under exactly its rights.
    pub fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let caller = CompartmentId::from_pkru(self.saved_pkru);
        if caller == self.compartment {
            return f();
        }
        let rt = Runtime::global().unwrap_or_else(|e| fatal(e));
        let out = with_context(rt, |ctx| {
            super::switch_into(rt, ctx, self.compartment, ctx.slot(caller), f)
        });
        match out {
            Ok(Ok(value)) => value,
            Ok(Err(e)) | Err(e) => fatal(e),
        }
    }
}
