//! Gated function pointers.
//!
//! A [`Gated`] pairs a function pointer with the compartment it must run in.
//! Calling it always crosses into that compartment, whoever holds it. Its
//! [`CodeAddr`] is the callee's own address, so a wrapped pointer compares
//! equal to the original.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use super::conditions::Conditions;
use super::manifest::GateManifest;
use super::signature::{Signature, normalize};
use crate::compartment::CompartmentId;
use crate::error::{GateResult, ManifestError, ManifestResult};
use crate::runtime::{Runtime, fatal};

/// A code address, for identity comparisons of function pointers.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeAddr(usize);

impl CodeAddr {
    pub const NULL: CodeAddr = CodeAddr(0);

    pub fn of<S: Signature>(f: S) -> Self {
        Self(f.addr())
    }

    /// Address of an optional gated pointer; `None` is [`CodeAddr::NULL`].
    pub fn of_gated<S: Signature>(gated: Option<&Gated<S>>) -> Self {
        gated.map_or(Self::NULL, Gated::addr)
    }

    pub fn get(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddr({:#x})", self.0)
    }
}

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of a signature type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureTag {
    id: TypeId,
    name: &'static str,
}

impl SignatureTag {
    pub fn of<S: Signature>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: S::descriptor(),
        }
    }

    pub fn name(self) -> &'static str {
        self.name
    }
}

/// A function pointer that runs in a fixed compartment.
pub struct Gated<S: Signature> {
    func: S,
    target: CompartmentId,
    tag: SignatureTag,
    conditions: Option<Arc<Conditions<S>>>,
}

impl<S: Signature> Gated<S> {
    pub fn new(target: CompartmentId, func: S) -> Self {
        Self {
            func,
            target,
            tag: SignatureTag::of::<S>(),
            conditions: None,
        }
    }

    /// Bind `func` to the target the manifest records for `symbol`.
    ///
    /// With `verify`, the manifest signature must match `S`.
    pub fn from_manifest(
        manifest: &GateManifest,
        symbol: &str,
        func: S,
        verify: bool,
    ) -> ManifestResult<Self> {
        let entry = manifest.lookup(symbol)?;
        if verify && normalize(&entry.signature) != normalize(S::descriptor()) {
            return Err(ManifestError::SignatureMismatch {
                symbol: symbol.to_string(),
                expected: entry.signature.clone(),
                actual: S::descriptor().to_string(),
            });
        }
        Ok(Self::new(entry.target, func))
    }

    /// Bind `func` through the installed runtime's manifest.
    pub fn bind(symbol: &str, func: S) -> GateResult<Self> {
        let rt = Runtime::global()?;
        let manifest = rt.manifest().ok_or_else(|| ManifestError::UnknownSymbol {
            symbol: symbol.to_string(),
        })?;
        Ok(Self::from_manifest(
            manifest,
            symbol,
            func,
            rt.config().verify_signatures,
        )?)
    }

    /// Attach pre/post conditions checked inside the target compartment.
    pub fn with_conditions(mut self, conditions: Conditions<S>) -> Self {
        self.conditions = Some(Arc::new(conditions));
        self
    }

    pub fn addr(&self) -> CodeAddr {
        CodeAddr::of(self.func)
    }

    pub fn target(&self) -> CompartmentId {
        self.target
    }

    pub fn tag(&self) -> SignatureTag {
        self.tag
    }

    /// Call in the target compartment.
    pub fn try_call(&self, args: S::Args) -> GateResult<S::Output> {
        let func = self.func;
        let conditions = self.conditions.clone();
        super::try_call_in(self.target, move || match conditions {
            Some(conditions) => conditions.run(func, args),
            None => func.invoke(args),
        })
    }

    /// Like [`try_call`](Self::try_call); errors are fatal.
    pub fn call(&self, args: S::Args) -> S::Output {
        self.try_call(args).unwrap_or_else(|e| fatal(e))
    }
}

impl<S: Signature> From<S> for Gated<S> {
    /// Bind to the compartment owning the function's code, or to the
    /// compartment the caller is in when the code is untagged.
    fn from(func: S) -> Self {
        let target = Runtime::try_global().map_or(CompartmentId::SHARED, |rt| {
            match rt.regions().find_containing(func.addr()) {
                Some(region) if !region.owner.is_shared() => region.owner,
                _ => rt.active_compartment(),
            }
        });
        Self::new(target, func)
    }
}

impl<S: Signature> Clone for Gated<S> {
    fn clone(&self) -> Self {
        Self {
            func: self.func,
            target: self.target,
            tag: self.tag,
            conditions: self.conditions.clone(),
        }
    }
}

impl<S: Signature> fmt::Debug for Gated<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gated")
            .field("addr", &self.addr())
            .field("target", &self.target)
            .field("signature", &self.tag.name)
            .field("conditions", &self.conditions.is_some())
            .finish()
    }
}

/// Two gated pointers are equal when they name the same code.
impl<S: Signature> PartialEq for Gated<S> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<S: Signature> Eq for Gated<S> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(x: u32) -> u32 {
        x * 2
    }

    #[test]
    fn null_code_addr() {
        assert!(CodeAddr::NULL.is_null());
        assert_eq!(CodeAddr::of_gated::<fn(u32) -> u32>(None), CodeAddr::NULL);
    }

    #[test]
    fn wrapped_pointer_keeps_its_address() {
        let f: fn(u32) -> u32 = double;
        let gated = Gated::new(CompartmentId::new(2).unwrap(), f);
        assert_eq!(gated.addr(), CodeAddr::of(f));
        assert_eq!(CodeAddr::of_gated(Some(&gated)), CodeAddr::of(f));
        assert_eq!(gated.clone(), gated);
    }

    #[test]
    fn equality_ignores_the_target() {
        let f: fn(u32) -> u32 = double;
        let in_main = Gated::new(CompartmentId::new(1).unwrap(), f);
        let in_plugin = Gated::new(CompartmentId::new(2).unwrap(), f);
        assert_eq!(in_main, in_plugin);
        assert_eq!(in_main.addr(), in_plugin.addr());

        let g: fn(u32) -> u32 = |x| x + 1;
        assert_ne!(Gated::new(CompartmentId::new(2).unwrap(), g), in_plugin);
    }

    #[test]
    fn manifest_binding_checks_signatures() {
        let manifest = GateManifest::from_toml_str(
            r#"
            [[gate]]
            symbol = "double"
            signature = "fn(u32) -> u32"
            source = 1
            target = 2
            "#,
            "inline",
        )
        .unwrap();
        let f: fn(u32) -> u32 = double;
        let gated = Gated::from_manifest(&manifest, "double", f, true).unwrap();
        assert_eq!(gated.target().get(), 2);

        let g: fn(u32, u32) -> u32 = |a, b| a + b;
        let err = Gated::from_manifest(&manifest, "double", g, true).unwrap_err();
        assert!(matches!(err, ManifestError::SignatureMismatch { .. }));
        assert!(Gated::from_manifest(&manifest, "double", g, false).is_ok());
    }

    #[test]
    fn tags_distinguish_signatures() {
        assert_ne!(
            SignatureTag::of::<fn(u32) -> u32>(),
            SignatureTag::of::<extern "C" fn(u32) -> u32>()
        );
    }
}
