//! Pre- and postconditions checked inside the callee's compartment.
//!
//! A failed check terminates the process through the exit path with the
//! failure's status; the callee's result never reaches the caller.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

use super::signature::Signature;

/// A rejected call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("gate condition failed: {message}")]
#[diagnostic(code(mpkgate::gate::condition))]
pub struct ConditionFailure {
    pub exit_status: i32,
    pub message: String,
}

impl ConditionFailure {
    pub fn new(exit_status: i32, message: impl Into<String>) -> Self {
        Self {
            exit_status,
            message: message.into(),
        }
    }
}

pub type PreCheck<S> = fn(&<S as Signature>::Args) -> Result<(), ConditionFailure>;
pub type PostCheck<S> = fn(&<S as Signature>::Output) -> Result<(), ConditionFailure>;
pub type PostArgsCheck<S> =
    fn(&<S as Signature>::Args, &<S as Signature>::Output) -> Result<(), ConditionFailure>;

/// Checks attached to a [`Gated`](super::Gated) function.
pub struct Conditions<S: Signature> {
    pre: Vec<PreCheck<S>>,
    post: Vec<PostCheck<S>>,
    post_args: Vec<PostArgsCheck<S>>,
    keep_args: Option<fn(&S::Args) -> S::Args>,
}

impl<S: Signature> Default for Conditions<S> {
    fn default() -> Self {
        Self {
            pre: Vec::new(),
            post: Vec::new(),
            post_args: Vec::new(),
            keep_args: None,
        }
    }
}

impl<S: Signature> fmt::Debug for Conditions<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conditions")
            .field("pre", &self.pre.len())
            .field("post", &(self.post.len() + self.post_args.len()))
            .finish()
    }
}

impl<S: Signature> Conditions<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre(mut self, check: PreCheck<S>) -> Self {
        self.pre.push(check);
        self
    }

    pub fn post(mut self, check: PostCheck<S>) -> Self {
        self.post.push(check);
        self
    }

    /// A postcondition that also sees the arguments. They are cloned before
    /// the call.
    pub fn post_with_args(mut self, check: PostArgsCheck<S>) -> Self
    where
        S::Args: Clone,
    {
        self.keep_args = Some(<S::Args as Clone>::clone);
        self.post_args.push(check);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty() && self.post_args.is_empty()
    }

    /// Check, call, check.
    pub(crate) fn run(&self, func: S, args: S::Args) -> S::Output {
        for check in &self.pre {
            if let Err(failure) = check(&args) {
                reject(failure);
            }
        }
        let kept = self.keep_args.map(|keep| keep(&args));
        let out = func.invoke(args);
        for check in &self.post {
            if let Err(failure) = check(&out) {
                reject(failure);
            }
        }
        if let Some(args) = &kept {
            for check in &self.post_args {
                if let Err(failure) = check(args, &out) {
                    reject(failure);
                }
            }
        }
        out
    }
}

fn reject(failure: ConditionFailure) -> ! {
    tracing::error!(
        status = failure.exit_status,
        message = %failure.message,
        "gate condition failed"
    );
    eprintln!("{failure}");
    super::entry::exit_process(failure.exit_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halve(x: u32) -> u32 {
        x / 2
    }

    type Halve = fn(u32) -> u32;

    #[test]
    fn passing_checks_return_the_result() {
        let conditions = Conditions::<Halve>::new()
            .pre(|(x,)| {
                if x % 2 == 0 {
                    Ok(())
                } else {
                    Err(ConditionFailure::new(3, "odd input"))
                }
            })
            .post(|out| {
                if *out < 100 {
                    Ok(())
                } else {
                    Err(ConditionFailure::new(4, "too large"))
                }
            })
            .post_with_args(|(x,), out| {
                if out * 2 == *x {
                    Ok(())
                } else {
                    Err(ConditionFailure::new(5, "lost precision"))
                }
            });
        assert!(!conditions.is_empty());
        assert_eq!(conditions.run(halve, (42,)), 21);
    }

    #[test]
    fn failure_formats_its_message() {
        let failure = ConditionFailure::new(7, "bad length");
        assert_eq!(failure.to_string(), "gate condition failed: bad length");
        assert_eq!(failure.exit_status, 7);
    }
}
