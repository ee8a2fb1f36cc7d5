use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::cell::ValueRef;
use crate::code::CodeRef;
use crate::env::EnvRef;

/// An interned-ish identifier. Cheap to clone and compare; ordered so that
/// attribute sets have a canonical iteration order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl AsRef<str>) -> Self {
        Symbol(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::new(name)
    }
}

/// An opaque provenance token attached to text values.
///
/// Tokens record what external content a piece of text was derived from. Two
/// texts with identical bytes but different provenance are *not* equal.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Provenance(Arc<str>);

impl Provenance {
    pub fn new(token: impl AsRef<str>) -> Self {
        Provenance(Arc::from(token.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~{}", self.0)
    }
}

/// A text value: content bytes plus an ordered dependency context.
#[derive(Debug, Clone)]
pub struct Text {
    content: Arc<str>,
    context: Arc<[Provenance]>,
}

impl Text {
    pub fn new(content: impl AsRef<str>) -> Self {
        Text {
            content: Arc::from(content.as_ref()),
            context: Arc::from([]),
        }
    }

    pub fn with_context(content: impl AsRef<str>, context: Vec<Provenance>) -> Self {
        Text {
            content: Arc::from(content.as_ref()),
            context: context.into(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// The ordered dependency context. Order is significant.
    pub fn context(&self) -> &[Provenance] {
        &self.context
    }
}

/// A reference to an external resource (file handle, connection, ...).
///
/// Resources are compared and hashed by their stable token; the engine never
/// looks behind the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    token: Arc<str>,
}

impl ResourceRef {
    pub fn new(token: impl AsRef<str>) -> Self {
        ResourceRef {
            token: Arc::from(token.as_ref()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Possibly-layered attribute bindings.
///
/// A later layer shadows earlier ones. All observation of a `Bindings` goes
/// through the deterministic *merged view*: lookup resolves through the layers
/// newest-first, and [`merged`](Self::merged) yields the shadow-resolved
/// mapping in canonical (sorted) key order. Raw layers are never exposed, so
/// hashing and equality cannot accidentally depend on how the layers happened
/// to be stacked.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    layers: Vec<Arc<BTreeMap<Symbol, ValueRef>>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_layer(&mut self, layer: BTreeMap<Symbol, ValueRef>) {
        self.layers.push(Arc::new(layer));
    }

    /// Looks a name up through the merged view (newest layer wins).
    pub fn get(&self, name: &Symbol) -> Option<&ValueRef> {
        self.layers.iter().rev().find_map(|layer| layer.get(name))
    }

    /// The shadow-resolved mapping in canonical key order.
    pub fn merged(&self) -> BTreeMap<Symbol, ValueRef> {
        let mut merged = BTreeMap::new();
        for layer in &self.layers {
            for (name, value) in layer.iter() {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// Number of distinct names in the merged view.
    pub fn len(&self) -> usize {
        self.merged().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_empty())
    }
}

impl FromIterator<(Symbol, ValueRef)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (Symbol, ValueRef)>>(iter: I) -> Self {
        let mut bindings = Bindings::new();
        bindings.push_layer(iter.into_iter().collect());
        bindings
    }
}

/// A closure: opaque code identity plus the captured environment.
///
/// Closures are structurally hashable (code shape + captured values) but are
/// never serialized; a captured environment cannot be reconstructed across
/// process boundaries.
#[derive(Debug, Clone)]
pub struct Closure {
    pub code: CodeRef,
    pub env: EnvRef,
}

/// A primitive operation applied to fewer arguments than it needs.
#[derive(Debug, Clone)]
pub struct PartialApply {
    pub prim: Symbol,
    pub args: Arc<[ValueRef]>,
}

/// An evaluated value.
///
/// Unevaluated thunks are not a `Value` variant: a lazily-bound position in
/// the value graph is a [`ValueCell`](crate::cell::ValueCell) whose slot holds
/// the thunk until it is forced. `List` and `Attrs` therefore contain cell
/// references, so laziness nests to arbitrary depth.
///
/// Cloning a `Value` is cheap: all aggregate payloads are behind `Arc`s.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(Text),
    Resource(ResourceRef),
    List(Arc<[ValueRef]>),
    Attrs(Bindings),
    Closure(Closure),
    PrimOpPartial(PartialApply),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Resource(_) => "resource",
            Value::List(_) => "list",
            Value::Attrs(_) => "attrs",
            Value::Closure(_) => "closure",
            Value::PrimOpPartial(_) => "primop-partial",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_attrs(&self) -> Option<&Bindings> {
        match self {
            Value::Attrs(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ValueRef]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ValueCell;

    #[test]
    fn bindings_later_layer_shadows() {
        let mut bindings = Bindings::new();
        bindings.push_layer(
            [
                (Symbol::new("a"), ValueCell::forced(Value::Int(1))),
                (Symbol::new("b"), ValueCell::forced(Value::Int(2))),
            ]
            .into_iter()
            .collect(),
        );
        bindings.push_layer(
            [(Symbol::new("a"), ValueCell::forced(Value::Int(10)))]
                .into_iter()
                .collect(),
        );

        let merged = bindings.merged();
        assert_eq!(merged.len(), 2);
        assert_eq!(bindings.len(), 2);

        let a = bindings.get(&Symbol::new("a")).unwrap();
        assert_eq!(a.peek().into_forced().unwrap().as_int(), Some(10));
    }

    #[test]
    fn merged_view_is_sorted() {
        let bindings: Bindings = [
            (Symbol::new("zeta"), ValueCell::forced(Value::Null)),
            (Symbol::new("alpha"), ValueCell::forced(Value::Null)),
        ]
        .into_iter()
        .collect();

        let names: Vec<_> = bindings
            .merged()
            .keys()
            .map(|s| s.as_str().to_owned())
            .collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
