//! Declarative helpers for the small enumerations used throughout the crate.
//! Keeping the command table, version table, and TinyTuya-style error codes
//! as macro invocations keeps the long, mechanical lists next to the call
//! site that needs them instead of duplicated across files.

/// Builds the `CommandType` enum from a list of `Name = 0xNN` pairs and a
/// `from_u32` lookup.
macro_rules! define_command_type {
    ( $( $name:ident = $val:expr ),+ $(,)? ) => {
        /// Tuya protocol command byte, as sent in the message header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandType {
            $( $name = $val ),+
        }

        impl CommandType {
            /// Resolve a raw command byte into its named variant, if known.
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $( $val => Some(Self::$name), )+
                    _ => None,
                }
            }
        }
    };
}

/// Builds the `Version` enum from a list of `Name = ("tag", numeric)` pairs.
/// Every generated variant additionally gets an `Auto` sibling for deferred
/// (discovery-resolved) versions.
macro_rules! define_version {
    ( $( $name:ident = ($tag:expr, $val:expr) ),+ $(,)? ) => {
        /// Tuya wire protocol dialect.
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub enum Version {
            $( $name, )+
            /// Version not yet known; resolved via discovery before connecting.
            Auto,
        }

        impl Version {
            /// The numeric protocol version, e.g. `3.3`.
            pub fn val(&self) -> f32 {
                match self {
                    $( Self::$name => $val, )+
                    Self::Auto => 0.0,
                }
            }

            /// The 3-byte ASCII version tag used as a payload header prefix.
            pub fn as_bytes(&self) -> &'static [u8] {
                match self {
                    $( Self::$name => $tag.as_bytes(), )+
                    Self::Auto => b"",
                }
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $( Self::$name => write!(f, "{}", $tag), )+
                    Self::Auto => write!(f, "Auto"),
                }
            }
        }

        impl std::str::FromStr for Version {
            type Err = ();

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $( $tag => Ok(Self::$name), )+
                    "Auto" | "auto" | "" => Ok(Self::Auto),
                    _ => Err(()),
                }
            }
        }

        impl From<&str> for Version {
            fn from(s: &str) -> Self {
                s.parse().unwrap_or(Self::Auto)
            }
        }

        impl From<String> for Version {
            fn from(s: String) -> Self {
                s.as_str().into()
            }
        }
    };
}

/// Builds a set of `pub const NAME: u32` TinyTuya-compatible error codes plus
/// a `get_error_message` lookup function.
macro_rules! define_error_codes {
    ( $( $name:ident = $code:expr => $msg:expr ),+ $(,)? ) => {
        $( pub const $name: u32 = $code; )+

        /// Human-readable message for a TinyTuya-style numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $( $code => $msg, )+
                _ => "Unknown error",
            }
        }
    };
}
