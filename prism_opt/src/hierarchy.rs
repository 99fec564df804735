//! Class table and class-hierarchy queries.
//!
//! The optimizer never mutates class metadata. It works against a frozen
//! [`ClassTable`] snapshot taken from a [`HierarchyRegistry`] when the
//! compile starts; the runtime may publish a new table concurrently without
//! affecting compiles already in flight. Optimizations that depend on a
//! negative hierarchy fact ("not overridden") record a
//! [`HierarchyDependency`] so an open-world runtime can invalidate the code
//! when the fact stops holding.

use crate::ir::graph::FlowGraph;
use crate::ir::types::{BinaryOp, ClassId, CmpOp, Literal, Selector, UnaryOp};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Functions
// =============================================================================

/// Identifier of a function in the class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// How a function is implemented.
#[derive(Debug, Clone)]
pub enum FunctionKind {
    /// Built-in primitive operation.
    Intrinsic(Selector),
    /// Reads field `offset` of the receiver.
    Getter { offset: u32 },
    /// Writes field `offset` of the receiver, returns null.
    Setter { offset: u32 },
    /// Returns a constant.
    Constant(Literal),
    /// General function body. Parameter 0 is the receiver.
    Body(Arc<FlowGraph>),
}

/// A method.
#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: Arc<str>,
    pub owner: ClassId,
    pub kind: FunctionKind,
}

// =============================================================================
// Classes
// =============================================================================

/// Metadata of one class.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: Arc<str>,
    pub superclass: Option<ClassId>,
    pub interfaces: SmallVec<[ClassId; 2]>,
    /// Instance fields, inherited ones included.
    pub num_fields: u32,
    /// Abstract classes have no instances.
    pub is_abstract: bool,
    methods: FxHashMap<Selector, FunctionId>,
}

/// A fact about the hierarchy that compiled code relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HierarchyDependency {
    /// Class whose subclasses must not override `selector`.
    pub class: ClassId,
    pub selector: Selector,
}

// =============================================================================
// Hierarchy Queries
// =============================================================================

/// Read-only hierarchy queries used by the optimizer.
pub trait ClassHierarchy {
    /// Class metadata.
    fn class(&self, cid: ClassId) -> Option<&ClassInfo>;

    /// Function metadata.
    fn function(&self, id: FunctionId) -> Option<&Function>;

    /// Resolve `selector` on instances of `cid`.
    fn lookup(&self, cid: ClassId, selector: &Selector) -> Option<FunctionId>;

    /// Whether some class extends `cid`.
    fn has_subclasses(&self, cid: ClassId) -> bool;

    /// Whether some class implements `cid` as an interface.
    fn is_implemented(&self, cid: ClassId) -> bool;

    /// Whether some proper subtype of `cid` resolves `selector` to a
    /// different target than `cid` does.
    fn is_overridden(&self, cid: ClassId, selector: &Selector) -> bool;

    /// Whether instances of `sub` are instances of `sup`.
    fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool;

    /// Every instantiable class that is a subtype of `ty`.
    fn concrete_subtypes(&self, ty: ClassId) -> Vec<ClassId>;
}

/// Concrete class table.
#[derive(Debug, Clone)]
pub struct ClassTable {
    classes: Vec<Option<ClassInfo>>,
    functions: Vec<Function>,
}

impl ClassTable {
    /// Table holding only the built-in classes.
    pub fn new() -> Self {
        let mut table = Self {
            classes: Vec::new(),
            functions: Vec::new(),
        };
        table.install_builtins();
        table
    }

    fn install_builtins(&mut self) {
        use BinaryOp::*;
        const INT_OPS: [BinaryOp; 11] = [
            Add, Sub, Mul, Div, TruncDiv, Mod, BitAnd, BitOr, BitXor, Shl, Shr,
        ];
        const COMPARES: [CmpOp; 6] = [
            CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge,
        ];

        let builtin = |table: &mut Self,
                       cid,
                       name: &str,
                       superclass,
                       interfaces: &[ClassId],
                       is_abstract| {
            table.put_class(ClassInfo {
                id: cid,
                name: Arc::from(name),
                superclass,
                interfaces: interfaces.iter().copied().collect(),
                num_fields: 0,
                is_abstract,
                methods: FxHashMap::default(),
            });
        };
        let object = Some(ClassId::OBJECT);
        builtin(self, ClassId::OBJECT, "Object", None, &[], false);
        builtin(self, ClassId::NULL, "Null", object, &[], false);
        builtin(self, ClassId::BOOL, "bool", object, &[], false);
        builtin(self, ClassId::NUM, "num", object, &[], true);
        builtin(self, ClassId::INT, "int", object, &[ClassId::NUM], true);
        builtin(self, ClassId::SMI, "_Smi", object, &[ClassId::INT], false);
        builtin(self, ClassId::MINT, "_Mint", object, &[ClassId::INT], false);
        builtin(self, ClassId::DOUBLE, "double", object, &[ClassId::NUM], false);
        builtin(self, ClassId::STRING, "String", object, &[], false);
        builtin(self, ClassId::ARRAY, "List", object, &[], false);
        builtin(self, ClassId::FLOAT32X4, "Float32x4", object, &[], false);
        builtin(self, ClassId::INT32X4, "Int32x4", object, &[], false);
        builtin(self, ClassId::FLOAT64X2, "Float64x2", object, &[], false);

        let intrinsic = |table: &mut Self, cid, sel: Selector| {
            table.define_method(cid, sel.clone(), FunctionKind::Intrinsic(sel));
        };
        intrinsic(self, ClassId::OBJECT, Selector::Compare(CmpOp::Eq));
        intrinsic(self, ClassId::OBJECT, Selector::Compare(CmpOp::Ne));
        for cid in [ClassId::SMI, ClassId::MINT] {
            for op in INT_OPS {
                intrinsic(self, cid, Selector::Binary(op));
            }
            for op in COMPARES {
                intrinsic(self, cid, Selector::Compare(op));
            }
            intrinsic(self, cid, Selector::Unary(UnaryOp::Negate));
            intrinsic(self, cid, Selector::Unary(UnaryOp::BitNot));
        }
        for op in [Add, Sub, Mul, Div, TruncDiv, Mod] {
            intrinsic(self, ClassId::DOUBLE, Selector::Binary(op));
        }
        for op in COMPARES {
            intrinsic(self, ClassId::DOUBLE, Selector::Compare(op));
        }
        intrinsic(self, ClassId::DOUBLE, Selector::Unary(UnaryOp::Negate));
        for sel in [
            Selector::Binary(Add),
            Selector::Compare(CmpOp::Eq),
            Selector::Compare(CmpOp::Ne),
            Selector::Index,
            Selector::Length,
        ] {
            intrinsic(self, ClassId::STRING, sel);
        }
        for sel in [Selector::Index, Selector::IndexSet, Selector::Length] {
            intrinsic(self, ClassId::ARRAY, sel);
        }
        for op in [Add, Sub, Mul, Div] {
            intrinsic(self, ClassId::FLOAT32X4, Selector::Binary(op));
            intrinsic(self, ClassId::FLOAT64X2, Selector::Binary(op));
        }
        for op in [Add, Sub, Mul, BitAnd, BitOr, BitXor] {
            intrinsic(self, ClassId::INT32X4, Selector::Binary(op));
        }
    }

    fn put_class(&mut self, info: ClassInfo) {
        let idx = info.id.0 as usize;
        if idx >= self.classes.len() {
            self.classes.resize(idx + 1, None);
        }
        self.classes[idx] = Some(info);
    }

    /// Define a concrete user class with `own_fields` fields beyond those
    /// inherited from `superclass`.
    pub fn define_class(&mut self, name: &str, superclass: ClassId, own_fields: u32) -> ClassId {
        let id = ClassId((self.classes.len() as u32).max(ClassId::FIRST_USER));
        let inherited = self.class(superclass).map_or(0, |c| c.num_fields);
        self.put_class(ClassInfo {
            id,
            name: Arc::from(name),
            superclass: Some(superclass),
            interfaces: SmallVec::new(),
            num_fields: inherited + own_fields,
            is_abstract: false,
            methods: FxHashMap::default(),
        });
        id
    }

    /// Define an abstract class usable as an interface.
    pub fn define_interface(&mut self, name: &str) -> ClassId {
        let id = self.define_class(name, ClassId::OBJECT, 0);
        if let Some(Some(info)) = self.classes.get_mut(id.0 as usize) {
            info.is_abstract = true;
        }
        id
    }

    /// Declare that `cid` implements `interface`.
    pub fn add_interface(&mut self, cid: ClassId, interface: ClassId) {
        if let Some(Some(info)) = self.classes.get_mut(cid.0 as usize) {
            if !info.interfaces.contains(&interface) {
                info.interfaces.push(interface);
            }
        }
    }

    /// Define (or override) a method on `cid`.
    pub fn define_method(
        &mut self,
        cid: ClassId,
        selector: Selector,
        kind: FunctionKind,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Function {
            id,
            name: Arc::from(selector.to_string().as_str()),
            owner: cid,
            kind,
        });
        if let Some(Some(info)) = self.classes.get_mut(cid.0 as usize) {
            info.methods.insert(selector, id);
        }
        id
    }

    /// All concrete classes.
    pub fn concrete_classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter().flatten().filter(|c| !c.is_abstract)
    }

    fn all_classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter().flatten()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassHierarchy for ClassTable {
    fn class(&self, cid: ClassId) -> Option<&ClassInfo> {
        self.classes.get(cid.0 as usize).and_then(Option::as_ref)
    }

    fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    fn lookup(&self, cid: ClassId, selector: &Selector) -> Option<FunctionId> {
        let mut current = Some(cid);
        while let Some(c) = current {
            let info = self.class(c)?;
            if let Some(&f) = info.methods.get(selector) {
                return Some(f);
            }
            current = info.superclass;
        }
        None
    }

    fn has_subclasses(&self, cid: ClassId) -> bool {
        self.all_classes().any(|c| c.superclass == Some(cid))
    }

    fn is_implemented(&self, cid: ClassId) -> bool {
        self.all_classes().any(|c| c.interfaces.contains(&cid))
    }

    fn is_overridden(&self, cid: ClassId, selector: &Selector) -> bool {
        let base = self.lookup(cid, selector);
        self.concrete_classes()
            .filter(|c| c.id != cid && self.is_subtype(c.id, cid))
            .any(|c| self.lookup(c.id, selector) != base)
    }

    fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup || sup == ClassId::OBJECT {
            return true;
        }
        let Some(info) = self.class(sub) else {
            return false;
        };
        info.superclass.is_some_and(|s| self.is_subtype(s, sup))
            || info.interfaces.iter().any(|&i| self.is_subtype(i, sup))
    }

    fn concrete_subtypes(&self, ty: ClassId) -> Vec<ClassId> {
        self.concrete_classes()
            .filter(|c| self.is_subtype(c.id, ty))
            .map(|c| c.id)
            .collect()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide holder of the current class table.
///
/// Compiles take an immutable snapshot; updates publish a new table.
#[derive(Debug, Default)]
pub struct HierarchyRegistry {
    current: RwLock<Arc<ClassTable>>,
}

impl HierarchyRegistry {
    /// Registry starting from `table`.
    pub fn new(table: ClassTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Frozen view for one compilation.
    pub fn snapshot(&self) -> Arc<ClassTable> {
        Arc::clone(&self.current.read())
    }

    /// Apply an update and publish the result. Existing snapshots are
    /// unaffected.
    pub fn update<R>(&self, f: impl FnOnce(&mut ClassTable) -> R) -> R {
        let mut guard = self.current.write();
        f(Arc::make_mut(&mut guard))
    }

    /// Dependencies that no longer hold in the current table.
    pub fn invalidated(&self, deps: &[HierarchyDependency]) -> Vec<HierarchyDependency> {
        let table = self.snapshot();
        deps.iter()
            .filter(|d| table.is_overridden(d.class, &d.selector))
            .cloned()
            .collect()
    }
}
