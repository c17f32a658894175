pub use crate::symbol::SymbolId;

/// Handle into the node arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub u32);

/// The closed set of built-in value variants. User-defined class instances
/// and conditions ride in `Instance`; `class-of` resolves every variant to a
/// class in the registry.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Integer(i64),
    BigInt(num_bigint::BigInt),
    Float(f64),
    Character(char),
    Symbol(u32),   // SymbolId
    Vector(u32),   // Handle into ArrayStore (vectors, strings, arrays)
    Closure(u32),  // Handle into the closure table
    Native(u32),   // Handle into the native function table
    Generic(u32),  // Handle into the generic function registry
    Instance(u32), // Handle into the instance table (incl. conditions)
    Class(u32),    // A class metaobject
    Stream(u32),   // Handle into StreamStore
}

impl Value {
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::BigInt(_) | Value::Float(_))
    }
}

// Mixed-mode numeric ordering; Nan never compares.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        use num_traits::ToPrimitive;
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::BigInt(b)) => {
                num_bigint::BigInt::from(*a).partial_cmp(b)
            }
            (Value::BigInt(a), Value::Integer(b)) => {
                a.partial_cmp(&num_bigint::BigInt::from(*b))
            }
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::BigInt(a), Value::Float(b)) => {
                a.to_f64().unwrap_or(f64::INFINITY).partial_cmp(b)
            }
            (Value::Float(a), Value::BigInt(b)) => {
                a.partial_cmp(&b.to_f64().unwrap_or(f64::INFINITY))
            }
            (Value::Character(a), Value::Character(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}
