//! Per-unit constant pool.

use crate::IndexSet;
use stackasm_compiler_core::ConstantData;

/// Interns constants in first-insertion order.
///
/// Keys are [`ConstantData`]'s bitwise identity, so `0.0` and `-0.0`, `1` and
/// `1.0` and `True`, or `(0.0,)` and `(-0.0,)` all get distinct slots. The pool
/// only grows.
#[derive(Clone, Debug, Default)]
pub struct ConstantPool {
    entries: IndexSet<ConstantData>,
}

impl ConstantPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool for a unit called `name`, with the leading slot functions expect:
    /// their docstring (or `None`) at index 0. Lambdas reserve `None`; class
    /// bodies and other `<...>` units (modules, comprehensions) reserve nothing.
    #[must_use]
    pub fn for_unit(name: &str, is_class: bool, docstring: Option<&str>) -> Self {
        let mut pool = Self::new();
        if is_class {
            return pool;
        }
        if name == "<lambda>" {
            pool.intern(ConstantData::None);
        } else if !name.starts_with('<') {
            pool.intern(docstring.map_or(ConstantData::None, ConstantData::str));
        }
        pool
    }

    /// Index of `value`, adding it if no equal key is present.
    pub fn intern(&mut self, value: ConstantData) -> u32 {
        let (index, _) = self.entries.insert_full(value);
        index as u32
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&ConstantData> {
        self.entries.get_index(index as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &ConstantData> + '_ {
        self.entries.iter()
    }

    #[must_use]
    pub fn into_boxed_slice(self) -> Box<[ConstantData]> {
        self.entries.into_iter().collect()
    }
}

impl FromIterator<ConstantData> for ConstantPool {
    fn from_iter<I: IntoIterator<Item = ConstantData>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
