//! Core data types shared by the non-bonded offload pipeline.
//!
//! Device-facing vector types are `#[repr(C)]` so their layout matches what an
//! accelerator kernel expects (`float3`/`float4`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Index, IndexMut, Mul, Neg, Sub};

/// Coulomb conversion factor 1/(4πε₀) in kJ mol⁻¹ nm e⁻².
pub const ONE_4PI_EPS0: f32 = 138.935_46;

/// Three-component single precision vector (coordinates, forces, shifts).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Float3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Float3 {
    pub const ZERO: Float3 = Float3 { x: 0.0, y: 0.0, z: 0.0 };

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn splat(v: f32) -> Self {
        Self { x: v, y: v, z: v }
    }

    #[inline]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn norm_sq(self) -> f32 {
        self.dot(self)
    }

    #[inline]
    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    #[inline]
    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    #[inline]
    pub fn from_array(a: [f32; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }
}

impl Add for Float3 {
    type Output = Float3;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Float3 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl Sub for Float3 {
    type Output = Float3;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Float3 {
    type Output = Float3;
    #[inline]
    fn mul(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Neg for Float3 {
    type Output = Float3;
    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Coordinates packed with the charge in `w`, the layout the force kernels read.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Float4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Float4 {
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    #[inline]
    pub fn from_xyz_q(xyz: Float3, q: f32) -> Self {
        Self::new(xyz.x, xyz.y, xyz.z, q)
    }

    #[inline]
    pub fn xyz(self) -> Float3 {
        Float3::new(self.x, self.y, self.z)
    }
}

/// Interaction locality: which half of the decomposed pair interactions.
///
/// Always use this to index the two-sized structures of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionLocality {
    Local = 0,
    NonLocal = 1,
}

impl InteractionLocality {
    pub const ALL: [InteractionLocality; 2] =
        [InteractionLocality::Local, InteractionLocality::NonLocal];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            InteractionLocality::Local => "local",
            InteractionLocality::NonLocal => "non-local",
        }
    }
}

impl fmt::Display for InteractionLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Atom range selector for transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomLocality {
    Local,
    NonLocal,
    All,
}

impl From<InteractionLocality> for AtomLocality {
    fn from(loc: InteractionLocality) -> Self {
        match loc {
            InteractionLocality::Local => AtomLocality::Local,
            InteractionLocality::NonLocal => AtomLocality::NonLocal,
        }
    }
}

/// One value per interaction locality.
///
/// The partition count is fixed at two, so this is a pair of named instances
/// rather than a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerLocality<T> {
    pub local: T,
    pub non_local: T,
}

impl<T> PerLocality<T> {
    pub fn new(local: T, non_local: T) -> Self {
        Self { local, non_local }
    }

    /// Build both instances from a constructor taking the locality.
    pub fn from_fn(mut f: impl FnMut(InteractionLocality) -> T) -> Self {
        Self {
            local: f(InteractionLocality::Local),
            non_local: f(InteractionLocality::NonLocal),
        }
    }

    /// Fallible variant of [`PerLocality::from_fn`].
    pub fn try_from_fn<E>(
        mut f: impl FnMut(InteractionLocality) -> Result<T, E>,
    ) -> Result<Self, E> {
        Ok(Self {
            local: f(InteractionLocality::Local)?,
            non_local: f(InteractionLocality::NonLocal)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (InteractionLocality, &T)> {
        [
            (InteractionLocality::Local, &self.local),
            (InteractionLocality::NonLocal, &self.non_local),
        ]
        .into_iter()
    }
}

impl<T> Index<InteractionLocality> for PerLocality<T> {
    type Output = T;
    #[inline]
    fn index(&self, loc: InteractionLocality) -> &T {
        match loc {
            InteractionLocality::Local => &self.local,
            InteractionLocality::NonLocal => &self.non_local,
        }
    }
}

impl<T> IndexMut<InteractionLocality> for PerLocality<T> {
    #[inline]
    fn index_mut(&mut self, loc: InteractionLocality) -> &mut T {
        match loc {
            InteractionLocality::Local => &mut self.local,
            InteractionLocality::NonLocal => &mut self.non_local,
        }
    }
}

/// Electrostatics flavors supported by the force kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectrostaticsModel {
    /// Real-space Ewald with a tabulated long-range correction.
    Ewald,
    /// Reaction field.
    ReactionField,
    /// Plain cutoff (reaction field with ε_rf = 1).
    Cutoff,
}

impl ElectrostaticsModel {
    /// Whether the model needs the tabulated Coulomb correction.
    pub fn uses_table(self) -> bool {
        matches!(self, ElectrostaticsModel::Ewald)
    }
}

impl fmt::Display for ElectrostaticsModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElectrostaticsModel::Ewald => "ewald",
            ElectrostaticsModel::ReactionField => "reaction-field",
            ElectrostaticsModel::Cutoff => "cutoff",
        };
        f.write_str(s)
    }
}

/// Simulation-wide running energy totals the staged values are folded into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyTotals {
    /// Lennard-Jones energy (kJ/mol)
    pub lj: f64,
    /// Electrostatic energy (kJ/mol)
    pub electrostatic: f64,
}

impl EnergyTotals {
    pub fn total(&self) -> f64 {
        self.lj + self.electrostatic
    }
}
