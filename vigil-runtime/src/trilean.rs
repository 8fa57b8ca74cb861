//! Three-valued truth.
//!
//! Rule bodies evaluate to true, false, or unknown; `Unknown` means the
//! truth of the expression still depends on unbound variables. The
//! combinator laws differ from `Option<bool>`: a conjunction with a false
//! part is false even if other parts are unknown, and dually for
//! disjunction.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trilean {
    True,
    False,
    Unknown,
}

impl Trilean {
    pub fn is_true(self) -> bool {
        self == Trilean::True
    }

    pub fn is_false(self) -> bool {
        self == Trilean::False
    }

    pub fn is_unknown(self) -> bool {
        self == Trilean::Unknown
    }

    pub fn and(self, other: Trilean) -> Trilean {
        match (self, other) {
            (Trilean::False, _) | (_, Trilean::False) => Trilean::False,
            (Trilean::Unknown, _) | (_, Trilean::Unknown) => Trilean::Unknown,
            _ => Trilean::True,
        }
    }

    pub fn or(self, other: Trilean) -> Trilean {
        match (self, other) {
            (Trilean::True, _) | (_, Trilean::True) => Trilean::True,
            (Trilean::Unknown, _) | (_, Trilean::Unknown) => Trilean::Unknown,
            _ => Trilean::False,
        }
    }

    pub fn negate(self) -> Trilean {
        match self {
            Trilean::True => Trilean::False,
            Trilean::False => Trilean::True,
            Trilean::Unknown => Trilean::Unknown,
        }
    }

    /// Conjunction over a sequence of parts.
    pub fn all(parts: impl IntoIterator<Item = Trilean>) -> Trilean {
        parts
            .into_iter()
            .fold(Trilean::True, |acc, part| acc.and(part))
    }
}

impl From<bool> for Trilean {
    fn from(value: bool) -> Self {
        if value {
            Trilean::True
        } else {
            Trilean::False
        }
    }
}

impl fmt::Display for Trilean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trilean::True => write!(f, "true"),
            Trilean::False => write!(f, "false"),
            Trilean::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn false_dominates_conjunction() {
        assert_eq!(Trilean::False.and(Trilean::Unknown), Trilean::False);
        assert_eq!(Trilean::Unknown.and(Trilean::False), Trilean::False);
    }

    #[test]
    fn unknown_taints_conjunction_of_trues() {
        assert_eq!(Trilean::True.and(Trilean::Unknown), Trilean::Unknown);
    }

    #[test]
    fn true_dominates_disjunction() {
        assert_eq!(Trilean::Unknown.or(Trilean::True), Trilean::True);
        assert_eq!(Trilean::False.or(Trilean::Unknown), Trilean::Unknown);
    }

    #[test]
    fn negation_fixes_unknown() {
        assert_eq!(Trilean::Unknown.negate(), Trilean::Unknown);
    }

    #[test]
    fn all_over_empty_is_true() {
        assert_eq!(Trilean::all(std::iter::empty()), Trilean::True);
    }
}
