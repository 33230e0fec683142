//! Dynamic property records.
//!
//! Components expose an optional property schema so that script-origin
//! callers (and the host editor) can read and write fields without knowing
//! the Rust type. Plain Rust components need no ceremony: the [`Component`]
//! defaults advertise an empty schema. Script-origin component kinds are
//! backed by [`DynamicRecord`], a growable record of tagged values.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::entity::EntityId;

/// The kinds a dynamic property can take.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PropertyKind {
    Bool,
    Int,
    Float,
    Vec2,
    Vec3,
    Str,
    Entity,
}

/// A dynamically typed value: a tagged union over the supported scalar,
/// vector and string kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Str(String),
    Entity(EntityId),
}

impl PropertyValue {
    pub fn kind(&self) -> Option<PropertyKind> {
        match self {
            PropertyValue::Nil => None,
            PropertyValue::Bool(_) => Some(PropertyKind::Bool),
            PropertyValue::Int(_) => Some(PropertyKind::Int),
            PropertyValue::Float(_) => Some(PropertyKind::Float),
            PropertyValue::Vec2(_) => Some(PropertyKind::Vec2),
            PropertyValue::Vec3(_) => Some(PropertyKind::Vec3),
            PropertyValue::Str(_) => Some(PropertyKind::Str),
            PropertyValue::Entity(_) => Some(PropertyKind::Entity),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl Default for PropertyValue {
    fn default() -> Self {
        PropertyValue::Nil
    }
}

/// One field of a component schema.
#[derive(Clone, Debug)]
pub struct PropertyInfo {
    pub name: String,
    pub kind: PropertyKind,
    pub default: PropertyValue,
}

impl PropertyInfo {
    pub fn new(name: impl Into<String>, kind: PropertyKind, default: PropertyValue) -> Self {
        PropertyInfo {
            name: name.into(),
            kind,
            default,
        }
    }
}

/// Ordered name→value record used as init data for dynamic component
/// insertion. Later entries overwrite earlier ones with the same name.
#[derive(Clone, Debug, Default)]
pub struct PropertyMap {
    entries: SmallVec<[(String, PropertyValue); 8]>,
}

impl PropertyMap {
    pub fn new() -> Self {
        PropertyMap::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) -> &mut Self {
        self.entries.push((name.into(), value));
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A typed data record attached to an entity.
///
/// The property hooks are optional; components that never cross the
/// dynamic boundary keep the defaults.
pub trait Component: Send + Sync + 'static {
    /// Schema advertised to dynamic callers. Empty by default.
    fn properties() -> Vec<PropertyInfo>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Sets a field by name. Returns `false` when the name is unknown or
    /// the value kind does not match.
    fn set_property(&mut self, _name: &str, _value: PropertyValue) -> bool {
        false
    }

    /// Reads a field by name.
    fn property(&self, _name: &str) -> Option<PropertyValue> {
        None
    }
}

/// Implements [`Component`] with a field-backed property schema.
///
/// ```ignore
/// #[derive(Default)]
/// struct Position { x: i64, y: i64 }
/// component_schema!(Position { x: Int, y: Int });
/// ```
#[macro_export]
macro_rules! component_schema {
    ($ty:ty { $($field:ident: $kind:ident),* $(,)? }) => {
        impl $crate::property::Component for $ty {
            fn properties() -> Vec<$crate::property::PropertyInfo> {
                vec![$($crate::property::PropertyInfo::new(
                    stringify!($field),
                    $crate::property::PropertyKind::$kind,
                    $crate::property::PropertyValue::Nil,
                )),*]
            }

            fn set_property(
                &mut self,
                name: &str,
                value: $crate::property::PropertyValue,
            ) -> bool {
                match name {
                    $(stringify!($field) => {
                        $crate::component_schema!(@set self, $field, $kind, value)
                    })*
                    _ => false,
                }
            }

            fn property(&self, name: &str) -> Option<$crate::property::PropertyValue> {
                match name {
                    $(stringify!($field) => {
                        Some($crate::component_schema!(@get self, $field, $kind))
                    })*
                    _ => None,
                }
            }
        }
    };

    (@set $self:ident, $field:ident, Bool, $value:ident) => {
        if let $crate::property::PropertyValue::Bool(v) = $value {
            $self.$field = v;
            true
        } else {
            false
        }
    };
    (@set $self:ident, $field:ident, Int, $value:ident) => {
        if let $crate::property::PropertyValue::Int(v) = $value {
            $self.$field = v as _;
            true
        } else {
            false
        }
    };
    (@set $self:ident, $field:ident, Float, $value:ident) => {
        if let $crate::property::PropertyValue::Float(v) = $value {
            $self.$field = v as _;
            true
        } else {
            false
        }
    };
    (@set $self:ident, $field:ident, Vec2, $value:ident) => {
        if let $crate::property::PropertyValue::Vec2(v) = $value {
            $self.$field = v;
            true
        } else {
            false
        }
    };
    (@set $self:ident, $field:ident, Vec3, $value:ident) => {
        if let $crate::property::PropertyValue::Vec3(v) = $value {
            $self.$field = v;
            true
        } else {
            false
        }
    };
    (@set $self:ident, $field:ident, Str, $value:ident) => {
        if let $crate::property::PropertyValue::Str(v) = $value {
            $self.$field = v;
            true
        } else {
            false
        }
    };
    (@set $self:ident, $field:ident, Entity, $value:ident) => {
        if let $crate::property::PropertyValue::Entity(v) = $value {
            $self.$field = v;
            true
        } else {
            false
        }
    };

    (@get $self:ident, $field:ident, Bool) => {
        $crate::property::PropertyValue::Bool($self.$field)
    };
    (@get $self:ident, $field:ident, Int) => {
        $crate::property::PropertyValue::Int($self.$field as i64)
    };
    (@get $self:ident, $field:ident, Float) => {
        $crate::property::PropertyValue::Float($self.$field as f64)
    };
    (@get $self:ident, $field:ident, Vec2) => {
        $crate::property::PropertyValue::Vec2($self.$field)
    };
    (@get $self:ident, $field:ident, Vec3) => {
        $crate::property::PropertyValue::Vec3($self.$field)
    };
    (@get $self:ident, $field:ident, Str) => {
        $crate::property::PropertyValue::Str($self.$field.clone())
    };
    (@get $self:ident, $field:ident, Entity) => {
        $crate::property::PropertyValue::Entity($self.$field)
    };
}

/// Record backing a script-origin component kind: one slot per schema
/// field, initialized from the schema defaults.
#[derive(Clone, Debug)]
pub struct DynamicRecord {
    schema: Arc<Vec<PropertyInfo>>,
    values: SmallVec<[PropertyValue; 8]>,
}

impl DynamicRecord {
    pub fn new(schema: Arc<Vec<PropertyInfo>>) -> Self {
        let values = schema.iter().map(|info| info.default.clone()).collect();
        DynamicRecord { schema, values }
    }

    fn slot(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|info| info.name == name)
    }
}

impl Component for DynamicRecord {
    fn set_property(&mut self, name: &str, value: PropertyValue) -> bool {
        match self.slot(name) {
            Some(index) => {
                let expected = self.schema[index].kind;
                if value.kind().map_or(false, |kind| kind != expected) {
                    return false;
                }
                self.values[index] = value;
                true
            }
            None => false,
        }
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        self.slot(name).map(|index| self.values[index].clone())
    }
}
