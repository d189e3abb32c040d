use std::fmt;
use std::sync::Arc;

use crate::bits::bytes_for_bits;

/// Unit a size descriptor counts in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WordSpace {
    Bit,
    Byte,
}

impl WordSpace {
    /// Convert `value` from this unit to `to`, rounding bits up to whole bytes.
    pub fn convert(self, value: u64, to: WordSpace) -> u64 {
        match (self, to) {
            (WordSpace::Bit, WordSpace::Byte) => bytes_for_bits(value),
            (WordSpace::Byte, WordSpace::Bit) => value * 8,
            _ => value,
        }
    }
}

/// Size function of an unknown-size descriptor: `(provider, instance) → size`.
pub type SizeFn<P, I> = Arc<dyn Fn(&P, &I) -> u64 + Send + Sync>;

/// Size contract for a codec.
///
/// `Fixed` sizes are known without looking at any data. `Unknown` sizes carry
/// bounds and a function that computes the exact size for one instance.
/// `P` is whatever the size function needs to consult besides the instance
/// (for example a type registry), `I` the instance type.
pub enum SizeDescriptor<P: ?Sized, I: ?Sized> {
    Fixed {
        unit: WordSpace,
        size: u64,
    },
    Unknown {
        unit: WordSpace,
        min: u64,
        max: Option<u64>,
        calc: SizeFn<P, I>,
    },
}

impl<P: ?Sized, I: ?Sized> SizeDescriptor<P, I> {
    pub fn fixed(unit: WordSpace, size: u64) -> Self {
        Self::Fixed { unit, size }
    }

    pub fn unknown<F>(unit: WordSpace, min: u64, max: Option<u64>, calc: F) -> Self
    where
        F: Fn(&P, &I) -> u64 + Send + Sync + 'static,
    {
        Self::Unknown {
            unit,
            min,
            max,
            calc: Arc::new(calc),
        }
    }

    pub fn unit(&self) -> WordSpace {
        match self {
            Self::Fixed { unit, .. } | Self::Unknown { unit, .. } => *unit,
        }
    }

    /// The size if it is known without data.
    pub fn fixed_size(&self) -> Option<u64> {
        match self {
            Self::Fixed { size, .. } => Some(*size),
            Self::Unknown { .. } => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed { .. })
    }

    pub fn min(&self) -> u64 {
        match self {
            Self::Fixed { size, .. } => *size,
            Self::Unknown { min, .. } => *min,
        }
    }

    pub fn max(&self) -> Option<u64> {
        match self {
            Self::Fixed { size, .. } => Some(*size),
            Self::Unknown { max, .. } => *max,
        }
    }

    /// Exact size of `instance`, in [`unit`](Self::unit).
    pub fn calc_unknown(&self, provider: &P, instance: &I) -> u64 {
        match self {
            Self::Fixed { size, .. } => *size,
            Self::Unknown { calc, .. } => calc(provider, instance),
        }
    }

    /// Exact size of `instance` converted to `unit`.
    pub fn calc_in(&self, unit: WordSpace, provider: &P, instance: &I) -> u64 {
        self.unit().convert(self.calc_unknown(provider, instance), unit)
    }

    /// Sum several descriptors.
    ///
    /// All fixed gives a fixed sum. Otherwise the sum is unknown with
    /// `min = Σ min` and `max = Σ max`, or no max if any part has none.
    /// Parts in different units are summed in bits.
    pub fn sum<It>(parts: It) -> Self
    where
        It: IntoIterator<Item = Self>,
        P: 'static,
        I: 'static,
    {
        let parts: Vec<Self> = parts.into_iter().collect();
        let unit = match parts.first().map(Self::unit) {
            Some(first) if parts.iter().all(|p| p.unit() == first) => first,
            Some(_) => WordSpace::Bit,
            None => WordSpace::Byte,
        };

        if parts.iter().all(Self::is_fixed) {
            let size = parts
                .iter()
                .map(|p| p.unit().convert(p.min(), unit))
                .sum();
            return Self::fixed(unit, size);
        }

        let min = parts.iter().map(|p| p.unit().convert(p.min(), unit)).sum();
        let max = parts
            .iter()
            .map(|p| p.max().map(|m| p.unit().convert(m, unit)))
            .sum::<Option<u64>>();
        Self::unknown(unit, min, max, move |provider, instance| {
            parts
                .iter()
                .map(|p| p.calc_in(unit, provider, instance))
                .sum()
        })
    }
}

impl<P: ?Sized, I: ?Sized> Clone for SizeDescriptor<P, I> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed { unit, size } => Self::Fixed {
                unit: *unit,
                size: *size,
            },
            Self::Unknown {
                unit,
                min,
                max,
                calc,
            } => Self::Unknown {
                unit: *unit,
                min: *min,
                max: *max,
                calc: Arc::clone(calc),
            },
        }
    }
}

impl<P: ?Sized, I: ?Sized> fmt::Debug for SizeDescriptor<P, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { unit, size } => write!(f, "Fixed({size} {unit:?})"),
            Self::Unknown { unit, min, max, .. } => match max {
                Some(max) => write!(f, "Unknown({min}..={max} {unit:?})"),
                None => write!(f, "Unknown({min}.. {unit:?})"),
            },
        }
    }
}
