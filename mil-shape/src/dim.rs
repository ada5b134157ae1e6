use std::fmt;

use smallvec::SmallVec;

use crate::sym_gen::{new_symbol, new_variadic_symbol};

/// A named placeholder for a dimension size that is only known when the
/// program runs.
///
/// Two symbols are equal only if they were produced by the same call to
/// [`new_symbol`].
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Symbol(pub(crate) u32);

impl Symbol {
    /// Return the numeric ID of this symbol.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A placeholder for an unknown number of unknown dimensions.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VariadicSymbol(pub(crate) u32);

impl VariadicSymbol {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VariadicSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*s{}", self.0)
    }
}

impl fmt::Debug for VariadicSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Size of a single tensor dimension.
#[derive(Copy, Clone, Eq, Hash, PartialEq)]
pub enum Dim {
    Fixed(usize),
    Symbol(Symbol),
}

impl Dim {
    /// Create a dimension with a fresh symbolic size.
    pub fn new_symbol() -> Dim {
        Dim::Symbol(new_symbol())
    }

    /// Return the size if it is known.
    pub fn fixed(self) -> Option<usize> {
        match self {
            Dim::Fixed(size) => Some(size),
            Dim::Symbol(_) => None,
        }
    }

    pub fn is_symbolic(self) -> bool {
        matches!(self, Dim::Symbol(_))
    }

    /// Return true if this dimension could have size `size` at runtime.
    pub fn admits(self, size: usize) -> bool {
        match self {
            Dim::Fixed(n) => n == size,
            Dim::Symbol(_) => true,
        }
    }
}

impl From<usize> for Dim {
    fn from(size: usize) -> Dim {
        Dim::Fixed(size)
    }
}

impl From<Symbol> for Dim {
    fn from(sym: Symbol) -> Dim {
        Dim::Symbol(sym)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(size) => write!(f, "{}", size),
            Dim::Symbol(sym) => write!(f, "{}", sym),
        }
    }
}

impl fmt::Debug for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Dimensions of a ranked shape.
pub type Dims = SmallVec<[Dim; 4]>;

/// Symbolic shape of a tensor.
///
/// A variadic symbol can only stand for a whole shape, so unknown-rank shapes
/// are a separate variant rather than a dimension kind.
#[derive(Clone, Eq, Hash, PartialEq)]
pub enum Shape {
    /// A shape of known rank. An empty list of dimensions is a scalar.
    Ranked(Dims),

    /// A shape of unknown rank.
    Unranked(VariadicSymbol),
}

impl Shape {
    pub fn scalar() -> Shape {
        Shape::Ranked(Dims::new())
    }

    /// Create a shape from a list of dimensions.
    pub fn from_dims<I: IntoIterator<Item = Dim>>(dims: I) -> Shape {
        Shape::Ranked(dims.into_iter().collect())
    }

    /// Create a shape where every dimension is known.
    pub fn fixed(sizes: &[usize]) -> Shape {
        Shape::Ranked(sizes.iter().map(|&size| Dim::Fixed(size)).collect())
    }

    /// Create a shape of rank `rank` where every dimension is a fresh symbol.
    pub fn symbolic(rank: usize) -> Shape {
        Shape::Ranked((0..rank).map(|_| Dim::new_symbol()).collect())
    }

    /// Create a shape of unknown rank.
    pub fn unranked() -> Shape {
        Shape::Unranked(new_variadic_symbol())
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims().map(|dims| dims.len())
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        match self {
            Shape::Ranked(dims) => Some(dims),
            Shape::Unranked(_) => None,
        }
    }

    /// Return dimension `index`, or `None` if the rank is unknown or the
    /// index is out of range.
    pub fn dim(&self, index: usize) -> Option<Dim> {
        self.dims().and_then(|dims| dims.get(index).copied())
    }

    /// Return the concrete sizes if every dimension is known.
    pub fn to_fixed(&self) -> Option<Vec<usize>> {
        self.dims()?.iter().map(|d| d.fixed()).collect()
    }

    /// Return true if the rank or any dimension is not known.
    pub fn is_symbolic(&self) -> bool {
        match self {
            Shape::Ranked(dims) => dims.iter().any(|d| d.is_symbolic()),
            Shape::Unranked(_) => true,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.rank() == Some(0)
    }

    /// Return the number of elements if the shape is fully known.
    pub fn num_elements(&self) -> Option<usize> {
        self.to_fixed().map(|sizes| sizes.iter().product())
    }

    /// Return true if a concrete tensor of shape `sizes` could have this
    /// shape. Symbolic dimensions match any size and an unranked shape
    /// matches any concrete shape.
    pub fn matches(&self, sizes: &[usize]) -> bool {
        match self {
            Shape::Ranked(dims) => {
                dims.len() == sizes.len()
                    && dims.iter().zip(sizes).all(|(dim, &size)| dim.admits(size))
            }
            Shape::Unranked(_) => true,
        }
    }

    /// Merge two shapes that describe the same value along different
    /// control paths. Dimensions that agree are kept and the rest become new
    /// symbols.
    pub fn merge(&self, other: &Shape) -> Shape {
        match (self.dims(), other.dims()) {
            (Some(a), Some(b)) if a.len() == b.len() => Shape::Ranked(
                a.iter()
                    .zip(b)
                    .map(|(&a, &b)| if a == b { a } else { Dim::new_symbol() })
                    .collect(),
            ),
            _ => Shape::unranked(),
        }
    }
}

impl From<&[usize]> for Shape {
    fn from(sizes: &[usize]) -> Shape {
        Shape::fixed(sizes)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(sizes: [usize; N]) -> Shape {
        Shape::fixed(&sizes)
    }
}

impl From<Vec<Dim>> for Shape {
    fn from(dims: Vec<Dim>) -> Shape {
        Shape::from_dims(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Ranked(dims) => {
                write!(f, "(")?;
                for (i, dim) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", dim)?;
                }
                write!(f, ")")
            }
            Shape::Unranked(sym) => write!(f, "({})", sym),
        }
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Construct a [`Shape`] from a list of dimensions, each of which can be a
/// `usize` or a [`Symbol`].
///
/// ```
/// use mil_shape::{shape, new_symbol};
///
/// let batch = new_symbol();
/// let s = shape![batch, 3, 224, 224];
/// assert_eq!(s.rank(), Some(4));
/// ```
#[macro_export]
macro_rules! shape {
    ($($dim:expr),* $(,)?) => {
        $crate::Shape::from_dims([$($crate::Dim::from($dim)),*])
    };
}
