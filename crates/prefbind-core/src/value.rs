#![forbid(unsafe_code)]

//! Tagged setting values and compile-time typed access.
//!
//! Stores traffic in [`SettingValue`], a closed sum over the scalar types a
//! platform setting can hold. Callers that know the type statically go
//! through [`SettingType`], so `store.get::<bool>("key")` cannot ask for a
//! type the store does not produce without the mismatch showing up as
//! `None`.

use serde::{Deserialize, Serialize};

/// Tag for the variants of [`SettingValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    Long,
    Float,
    Text,
}

impl ValueKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scalar setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SettingValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Text(String),
}

impl SettingValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
        }
    }

    /// Typed view of this value, `None` on a kind mismatch.
    #[must_use]
    pub fn get<T: SettingType>(self) -> Option<T> {
        T::from_value(self)
    }
}

/// Rust types that map onto exactly one [`ValueKind`].
pub trait SettingType: Sized {
    const KIND: ValueKind;

    fn into_value(self) -> SettingValue;

    fn from_value(value: SettingValue) -> Option<Self>;
}

macro_rules! setting_type {
    ($ty:ty, $variant:ident) => {
        impl SettingType for $ty {
            const KIND: ValueKind = ValueKind::$variant;

            fn into_value(self) -> SettingValue {
                SettingValue::$variant(self)
            }

            fn from_value(value: SettingValue) -> Option<Self> {
                match value {
                    SettingValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }

        impl From<$ty> for SettingValue {
            fn from(v: $ty) -> Self {
                SettingValue::$variant(v)
            }
        }
    };
}

setting_type!(bool, Bool);
setting_type!(i32, Int);
setting_type!(i64, Long);
setting_type!(f32, Float);
setting_type!(String, Text);

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}
