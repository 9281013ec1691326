//! Function signatures a gate can carry.
//!
//! Implemented for plain and `extern "C"` function pointers of up to ten
//! arguments. Arguments travel as a tuple so one generic gate path serves
//! every arity.

/// A callable function-pointer type.
pub trait Signature: Copy + Send + Sync + 'static {
    /// Arguments as a tuple.
    type Args;
    type Output;

    /// Call through the pointer.
    fn invoke(self, args: Self::Args) -> Self::Output;

    /// Code address of the pointee.
    fn addr(self) -> usize;

    /// Human-readable signature, used for manifest checks.
    fn descriptor() -> &'static str {
        std::any::type_name::<Self>()
    }
}

macro_rules! impl_signature {
    ($($arg:ident),*) => {
        impl<Ret: 'static, $($arg: 'static),*> Signature for fn($($arg),*) -> Ret {
            type Args = ($($arg,)*);
            type Output = Ret;

            #[allow(non_snake_case)]
            fn invoke(self, ($($arg,)*): Self::Args) -> Ret {
                (self)($($arg),*)
            }

            fn addr(self) -> usize {
                self as usize
            }
        }

        impl<Ret: 'static, $($arg: 'static),*> Signature for extern "C" fn($($arg),*) -> Ret {
            type Args = ($($arg,)*);
            type Output = Ret;

            #[allow(non_snake_case)]
            fn invoke(self, ($($arg,)*): Self::Args) -> Ret {
                (self)($($arg),*)
            }

            fn addr(self) -> usize {
                self as usize
            }
        }
    };
}

impl_signature!();
impl_signature!(A1);
impl_signature!(A1, A2);
impl_signature!(A1, A2, A3);
impl_signature!(A1, A2, A3, A4);
impl_signature!(A1, A2, A3, A4, A5);
impl_signature!(A1, A2, A3, A4, A5, A6);
impl_signature!(A1, A2, A3, A4, A5, A6, A7);
impl_signature!(A1, A2, A3, A4, A5, A6, A7, A8);
impl_signature!(A1, A2, A3, A4, A5, A6, A7, A8, A9);
impl_signature!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10);

/// Strip whitespace so `fn(u32,u32)->u32` and `fn(u32, u32) -> u32` compare equal.
pub fn normalize(descriptor: &str) -> String {
    descriptor.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: u32, b: u32) -> u32 {
        a + b
    }

    extern "C" fn mix(a: u8, b: f64, c: i64) -> f64 {
        a as f64 + b + c as f64
    }

    #[test]
    fn invokes_with_tuple_arguments() {
        let f: fn(u32, u32) -> u32 = add;
        assert_eq!(f.invoke((2, 3)), 5);
        let g: extern "C" fn(u8, f64, i64) -> f64 = mix;
        assert_eq!(g.invoke((1, 0.5, 2)), 3.5);
    }

    #[test]
    fn zero_arguments() {
        fn seven() -> u8 {
            7
        }
        let f: fn() -> u8 = seven;
        assert_eq!(f.invoke(()), 7);
    }

    #[test]
    fn descriptors_name_the_types() {
        let d = <extern "C" fn(u8, f64, i64) -> f64 as Signature>::descriptor();
        assert_eq!(normalize(d), "extern\"C\"fn(u8,f64,i64)->f64");
        assert_eq!(normalize("fn(u32, u32) -> u32"), "fn(u32,u32)->u32");
    }

    #[test]
    fn addr_is_the_code_address() {
        let f: fn(u32, u32) -> u32 = add;
        assert_eq!(f.addr(), f as usize);
        assert_ne!(f.addr(), 0);
    }
}
