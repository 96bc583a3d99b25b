/// Define an enumeration with known variants and an unknown representation.
///
/// Protocol fields such as the IP protocol number only standardize some of their values. The
/// macro derives lossless converters between the enumeration and its underlying integer so that
/// unknown values survive a parse and emit cycle unchanged.
// Copyright (C) 2016 whitequark@whitequark.org
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $( $variant:ident = $value:expr ),+ $(,)*
        }
    ) => {
        enum_with_unknown! {
            $( #[$enum_attr] )*
            pub doc enum $name($ty) {
                $( #[allow(missing_docs)] $variant = $value ),+
            }
        }
    };
    (
        $( #[$enum_attr:meta] )*
        pub doc enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )+
              $variant:ident = $value:expr $(,)*
            ),+
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// A value without a registered interpretation.
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

#[cfg(feature = "log")]
#[macro_use]
mod logging {
    macro_rules! net_log {
        (trace, $($arg:expr),*) => { ::log::trace!(target: "inet", $($arg),*) };
        (debug, $($arg:expr),*) => { ::log::debug!(target: "inet", $($arg),*) };
        (warn, $($arg:expr),*) => { ::log::warn!(target: "inet", $($arg),*) };
    }
}

#[cfg(not(feature = "log"))]
#[macro_use]
mod logging {
    macro_rules! net_log {
        ($level:ident, $($arg:expr),*) => {{ $( let _ = &$arg; )* }}
    }
}

macro_rules! net_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

macro_rules! net_debug {
    ($($arg:expr),*) => (net_log!(debug, $($arg),*));
}

macro_rules! net_warn {
    ($($arg:expr),*) => (net_log!(warn, $($arg),*));
}
