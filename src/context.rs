use crate::FxIndexMap;
use elsa::FrozenIndexSet;
use std::cell::Cell;
use std::convert::TryInto;
use std::fmt;
use std::hash::Hash;

/// Context object with global resources for a `Module` and its functions.
///
/// Those resources currently are:
/// * interners, for anything without an identity, and which can be deduplicated
///   (strings, types, constants - including `undef` placeholders)
/// * "entity" allocators, for everything else - i.e. anything with an identity
///   that needs to remain unique across an entire `Context`
///   * the *definition* of an entity isn't kept in the `Context`, but rather in
///     some `EntityDefs` collection somewhere in a `Module` (or further nested),
///     with only the entity *indices* being allocated by the `Context`
///
/// The entity allocators are the only source of fresh IDs (for functions,
/// blocks and instructions), and they only ever grow, so IDs are never reused.
pub struct Context {
    interners: Interners,
    entity_allocs: EntityAllocs,
}

/// Dispatch helper, to allow implementing interning logic on
/// the type passed to `cx.intern(...)`.
pub trait InternInCx {
    type Interned;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned;
}

impl Context {
    pub fn new() -> Self {
        Context {
            interners: Interners::default(),
            entity_allocs: EntityAllocs::default(),
        }
    }

    pub fn intern<T: InternInCx>(&self, x: T) -> T::Interned {
        x.intern_in_cx(self)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Collection holding the actual definitions for `Context`-allocated entities.
///
/// The only `E` (entity) types allowed are the ones declared by the `entities!`
/// macro below, which also determines the definition type (`E::Def`).
///
/// There is no way to generate entity indices without defining the entity in
/// an `EntityDefs`, but (unlike interned values) definitions can be iterated,
/// in the order they were defined.
pub struct EntityDefs<E: Entity> {
    map: FxIndexMap<E, E::Def>,
}

impl<E: Entity> Default for EntityDefs<E> {
    fn default() -> Self {
        Self {
            map: FxIndexMap::default(),
        }
    }
}

impl<E: Entity> EntityDefs<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, cx: &Context, def: E::Def) -> E {
        let entity = E::alloc(cx);
        assert!(self.map.insert(entity, def).is_none());
        entity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, entity: E) -> bool {
        self.map.contains_key(&entity)
    }

    pub fn get(&self, entity: E) -> Option<&E::Def> {
        self.map.get(&entity)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (E, &E::Def)> + '_ {
        self.map.iter().map(|(&entity, def)| (entity, def))
    }

    pub fn iter_mut(&mut self) -> impl ExactSizeIterator<Item = (E, &mut E::Def)> + '_ {
        self.map.iter_mut().map(|(&entity, def)| (entity, def))
    }
}

impl<E: Entity> std::ops::Index<E> for EntityDefs<E> {
    type Output = E::Def;

    #[track_caller]
    fn index(&self, entity: E) -> &E::Def {
        match self.map.get(&entity) {
            Some(def) => def,
            None => panic!("{entity:?} is not defined in this `EntityDefs`"),
        }
    }
}

impl<E: Entity> std::ops::IndexMut<E> for EntityDefs<E> {
    #[track_caller]
    fn index_mut(&mut self, entity: E) -> &mut E::Def {
        match self.map.get_mut(&entity) {
            Some(def) => def,
            None => panic!("{entity:?} is not defined in this `EntityDefs`"),
        }
    }
}

/// Entity index types (implemented only by the `entities!` macro below).
pub trait Entity: Copy + Eq + Hash + fmt::Debug {
    type Def;

    /// Allocate a fresh index, never handed out before by `cx`.
    fn alloc(cx: &Context) -> Self;
}

struct Interner<T: ?Sized>(FrozenIndexSet<Box<T>>);

impl<T: ?Sized + Eq + Hash> Default for Interner<T> {
    fn default() -> Self {
        Self(FrozenIndexSet::new())
    }
}

impl<T: ?Sized + Eq + Hash> Interner<T> {
    #[track_caller]
    fn intern(&self, value: impl AsRef<T> + Into<Box<T>>) -> u32 {
        if let Some((i, _)) = self.0.get_full(value.as_ref()) {
            return i as u32;
        }
        let (i, _) = self.0.insert_full(value.into());
        i.try_into().expect("interner overflowed u32")
    }
}

macro_rules! interners {
    (
        needs_as_ref { $($needs_as_ref_ty:ty),* $(,)? }
        $($name:ident($prefix:literal) => $ty:ty),+ $(,)?
    ) => {
        $(impl AsRef<Self> for $needs_as_ref_ty {
            fn as_ref(&self) -> &Self {
                self
            }
        })*

        #[allow(non_snake_case)]
        #[derive(Default)]
        struct Interners {
            $($name: Interner<$ty>),*
        }

        $(
            // NOTE never derive `PartialOrd, Ord` for these types, as
            // observing the interning order shouldn't be allowed.
            #[derive(Copy, Clone, PartialEq, Eq, Hash)]
            pub struct $name(u32);

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }

            impl std::ops::Index<$name> for Context {
                type Output = $ty;

                fn index(&self, interned: $name) -> &Self::Output {
                    &self.interners.$name.0[interned.0 as usize]
                }
            }
        )*
    };
}

interners! {
    needs_as_ref {
        crate::TypeDef,
        crate::ConstDef,
    }

    InternedStr("str") => str,
    Type("type") => crate::TypeDef,
    Const("const") => crate::ConstDef,
}

impl InternInCx for &'_ str {
    type Interned = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        InternedStr(cx.interners.InternedStr.intern(self))
    }
}

impl InternInCx for String {
    type Interned = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        InternedStr(cx.interners.InternedStr.intern(self))
    }
}

impl InternInCx for crate::TypeDef {
    type Interned = Type;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned {
        Type(cx.interners.Type.intern(self))
    }
}

impl InternInCx for crate::ConstDef {
    type Interned = Const;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned {
        Const(cx.interners.Const.intern(self))
    }
}

macro_rules! entities {
    (
        $($name:ident($prefix:literal) => $def:ty),+ $(,)?
    ) => {
        #[allow(non_snake_case)]
        #[derive(Default)]
        struct EntityAllocs {
            $($name: Cell<u32>),*
        }

        $(
            // NOTE never derive `PartialOrd, Ord` for these types, as
            // observing the entity index allocation order shouldn't be allowed.
            #[derive(Copy, Clone, PartialEq, Eq, Hash)]
            pub struct $name(u32);

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }

            impl Entity for $name {
                type Def = $def;

                fn alloc(cx: &Context) -> Self {
                    let idx = $name(cx.entity_allocs.$name.get());
                    let next_idx = idx.0.checked_add(1).expect("entity index overflowed u32");
                    cx.entity_allocs.$name.set(next_idx);
                    idx
                }
            }
        )*
    };
}

entities! {
    Func("func") => crate::FuncDecl,
    Block("block") => crate::BlockDef,
    Inst("v") => crate::InstDef,
}
