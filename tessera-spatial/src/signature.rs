//! Bit-packed phenotype signatures over a study's channels.
//!
//! Channels are ordered by identifier and channel `i` in that order owns bit
//! `i` of an [`Expression`]. A cell's expression integer has bit `i` set iff
//! the cell is positive for channel `i`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use tessera_core::{Result, TesseraError};

/// Packed positivity calls of one cell.
pub type Expression = u64;

/// Largest channel panel an [`Expression`] can hold.
pub const MAX_CHANNELS: usize = Expression::BITS as usize;

/// A stained marker (chemical species) of a study.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Channel {
    pub identifier: i64,
    pub symbol: String,
}

impl Channel {
    pub fn new(identifier: i64, symbol: impl Into<String>) -> Self {
        Self {
            identifier,
            symbol: symbol.into(),
        }
    }
}

/// Polarity of a phenotype criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
        }
    }
}

impl FromStr for Polarity {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "positive" => Ok(Polarity::Positive),
            "negative" => Ok(Polarity::Negative),
            other => Err(TesseraError::Parse(format!("unknown polarity '{}'", other))),
        }
    }
}

/// Positive and negative marker sets of a phenotype.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhenotypeCriteria {
    pub positive_markers: BTreeSet<String>,
    pub negative_markers: BTreeSet<String>,
}

impl PhenotypeCriteria {
    pub fn new<P, N>(positive: P, negative: N) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            positive_markers: positive.into_iter().map(Into::into).collect(),
            negative_markers: negative.into_iter().map(Into::into).collect(),
        }
    }

    /// `<symbol>+` and nothing else.
    pub fn single_marker(symbol: &str) -> Self {
        Self::new([symbol], Vec::<String>::new())
    }

    pub fn add(&mut self, symbol: impl Into<String>, polarity: Polarity) {
        match polarity {
            Polarity::Positive => self.positive_markers.insert(symbol.into()),
            Polarity::Negative => self.negative_markers.insert(symbol.into()),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.positive_markers.is_empty() && self.negative_markers.is_empty()
    }
}

impl fmt::Display for PhenotypeCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .positive_markers
            .iter()
            .map(|m| format!("{}+", m))
            .chain(self.negative_markers.iter().map(|m| format!("{}-", m)))
            .collect();
        write!(f, "{}", terms.join(" "))
    }
}

/// A named phenotype as defined in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Phenotype {
    pub name: String,
    pub criteria: PhenotypeCriteria,
}

impl Phenotype {
    /// Fails when the criterion set is empty.
    pub fn new(name: impl Into<String>, criteria: PhenotypeCriteria) -> Result<Self> {
        let name = name.into();
        if criteria.is_empty() {
            return Err(TesseraError::InvalidInput(format!(
                "phenotype '{}' has an empty criterion set",
                name
            )));
        }
        Ok(Self { name, criteria })
    }
}

/// How a signature is tested against an expression integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// `e == s⁺`
    Exact,
    /// `(e | s⁺) == e`
    Partial,
    /// Partial on positives and no negative marker positive.
    #[default]
    SignedPartial,
}

/// Positive and negative bit masks of a phenotype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Signature {
    pub positive: Expression,
    pub negative: Expression,
}

impl Signature {
    pub fn matches_exact(&self, e: Expression) -> bool {
        e == self.positive
    }

    pub fn matches_partial(&self, e: Expression) -> bool {
        (e | self.positive) == e
    }

    /// Signed partial match; the empty signature matches every cell.
    pub fn matches(&self, e: Expression) -> bool {
        (e | self.positive) == e && (!e | self.negative) == !e
    }

    pub fn matches_with(&self, e: Expression, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Exact => self.matches_exact(e),
            MatchMode::Partial => self.matches_partial(e),
            MatchMode::SignedPartial => self.matches(e),
        }
    }
}

/// A phenotype name with its compiled signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhenotypeSignature {
    pub name: String,
    pub signature: Signature,
}

/// Channel-to-bit assignment of one study.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelIndex {
    channels: Vec<Channel>,
    bit_by_symbol: HashMap<String, u32>,
    bit_by_id: HashMap<i64, u32>,
}

impl ChannelIndex {
    /// Assign bits in ascending channel-identifier order.
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Result<Self> {
        let mut channels: Vec<Channel> = channels.into_iter().collect();
        channels.sort_by_key(|c| c.identifier);
        if channels.len() > MAX_CHANNELS {
            return Err(TesseraError::InvalidInput(format!(
                "{} channels exceed the {}-bit expression width",
                channels.len(),
                MAX_CHANNELS
            )));
        }

        let mut bit_by_symbol = HashMap::with_capacity(channels.len());
        let mut bit_by_id = HashMap::with_capacity(channels.len());
        for (bit, c) in channels.iter().enumerate() {
            let bit = bit as u32;
            if bit_by_id.insert(c.identifier, bit).is_some() {
                return Err(TesseraError::InvalidInput(format!(
                    "duplicate channel identifier {}",
                    c.identifier
                )));
            }
            if bit_by_symbol.insert(c.symbol.clone(), bit).is_some() {
                return Err(TesseraError::InvalidInput(format!(
                    "duplicate channel symbol '{}'",
                    c.symbol
                )));
            }
        }
        Ok(Self {
            channels,
            bit_by_symbol,
            bit_by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels in bit order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.symbol.as_str())
    }

    pub fn bit_for_symbol(&self, symbol: &str) -> Option<u32> {
        self.bit_by_symbol.get(symbol).copied()
    }

    pub fn bit_for_id(&self, identifier: i64) -> Option<u32> {
        self.bit_by_id.get(&identifier).copied()
    }

    /// Expression with every channel bit set.
    pub fn full_mask(&self) -> Expression {
        match self.channels.len() {
            MAX_CHANNELS => Expression::MAX,
            n => (1 << n) - 1,
        }
    }

    /// Compile criteria into positive and negative masks.
    pub fn signature(&self, criteria: &PhenotypeCriteria) -> Result<Signature> {
        let mask = |markers: &BTreeSet<String>| -> Result<Expression> {
            markers.iter().try_fold(0, |acc, symbol| {
                self.bit_for_symbol(symbol)
                    .map(|bit| acc | (1 << bit))
                    .ok_or_else(|| TesseraError::UnknownChannel(symbol.clone()))
            })
        };
        Ok(Signature {
            positive: mask(&criteria.positive_markers)?,
            negative: mask(&criteria.negative_markers)?,
        })
    }

    pub fn compile(&self, phenotypes: &[Phenotype]) -> Result<Vec<PhenotypeSignature>> {
        phenotypes
            .iter()
            .map(|p| {
                Ok(PhenotypeSignature {
                    name: p.name.clone(),
                    signature: self.signature(&p.criteria)?,
                })
            })
            .collect()
    }

    /// One `<symbol>+` phenotype per channel, named by the symbol.
    pub fn single_marker_phenotypes(&self) -> Vec<Phenotype> {
        self.channels
            .iter()
            .map(|c| Phenotype {
                name: c.symbol.clone(),
                criteria: PhenotypeCriteria::single_marker(&c.symbol),
            })
            .collect()
    }

    /// Symbols of the channels set in `e`.
    pub fn positive_symbols(&self, e: Expression) -> Vec<&str> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(bit, _)| e & (1 << bit) != 0)
            .map(|(_, c)| c.symbol.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_channels() -> ChannelIndex {
        ChannelIndex::new(vec![Channel::new(7, "B"), Channel::new(3, "A")]).unwrap()
    }

    #[test]
    fn bits_follow_identifier_order() {
        let idx = two_channels();
        assert_eq!(idx.bit_for_symbol("A"), Some(0));
        assert_eq!(idx.bit_for_symbol("B"), Some(1));
        assert_eq!(idx.bit_for_id(7), Some(1));
        assert_eq!(idx.full_mask(), 0b11);
        assert_eq!(idx.positive_symbols(0b10), vec!["B"]);
    }

    #[test]
    fn partial_match_selects_a_positive_cells() {
        let idx = two_channels();
        let s = idx.signature(&PhenotypeCriteria::single_marker("A")).unwrap();
        assert_eq!(s.positive, 0b01);
        let matched: Vec<Expression> = [0b01, 0b11, 0b10]
            .into_iter()
            .filter(|&e| s.matches_partial(e))
            .collect();
        assert_eq!(matched, vec![0b01, 0b11]);
    }

    #[test]
    fn partial_match_is_subset_test() {
        let idx = ChannelIndex::new((0..6).map(|i| Channel::new(i, format!("M{}", i)))).unwrap();
        let criteria = PhenotypeCriteria::new(["M1", "M4"], Vec::<String>::new());
        let s = idx.signature(&criteria).unwrap();
        for e in 0..64u64 {
            let positives: BTreeSet<&str> = idx.positive_symbols(e).into_iter().collect();
            let subset = criteria.positive_markers.iter().all(|m| positives.contains(m.as_str()));
            assert_eq!(s.matches_partial(e), subset, "e={:b}", e);
        }
    }

    #[test]
    fn signed_partial_respects_negatives() {
        let idx = two_channels();
        let s = idx.signature(&PhenotypeCriteria::new(["A"], ["B"])).unwrap();
        assert!(s.matches(0b01));
        assert!(!s.matches(0b11));
        assert!(!s.matches(0b10));
        assert!(s.matches_with(0b01, MatchMode::Exact));
        assert!(!s.matches_with(0b11, MatchMode::Exact));
        assert!(s.matches_with(0b11, MatchMode::Partial));
    }

    #[test]
    fn empty_signature_matches_everything() {
        let s = two_channels().signature(&PhenotypeCriteria::default()).unwrap();
        assert!((0..4).all(|e| s.matches(e)));
    }

    #[test]
    fn unknown_channel() {
        let err = two_channels()
            .signature(&PhenotypeCriteria::single_marker("CD3"))
            .unwrap_err();
        assert!(matches!(err, TesseraError::UnknownChannel(ref s) if s == "CD3"));
    }

    #[test]
    fn rejects_duplicates_and_wide_panels() {
        assert!(ChannelIndex::new(vec![Channel::new(1, "A"), Channel::new(1, "B")]).is_err());
        assert!(ChannelIndex::new(vec![Channel::new(1, "A"), Channel::new(2, "A")]).is_err());
        assert!(ChannelIndex::new((0..65).map(|i| Channel::new(i, i.to_string()))).is_err());
        let full = ChannelIndex::new((0..64).map(|i| Channel::new(i, i.to_string()))).unwrap();
        assert_eq!(full.full_mask(), u64::MAX);
    }

    #[test]
    fn empty_phenotype_is_invalid() {
        assert!(Phenotype::new("nothing", PhenotypeCriteria::default()).is_err());
        let p = Phenotype::new("T cell", PhenotypeCriteria::new(["CD3"], ["CD20"])).unwrap();
        assert_eq!(p.criteria.to_string(), "CD3+ CD20-");
    }

    #[test]
    fn polarity_parsing() {
        assert_eq!("positive".parse::<Polarity>().unwrap(), Polarity::Positive);
        assert!("maybe".parse::<Polarity>().is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn partial_match_is_subset_test(positive in any::<u64>(), e in any::<u64>()) {
            let s = Signature { positive, negative: 0 };
            prop_assert_eq!(s.matches_partial(e), positive & !e == 0);
            prop_assert_eq!(s.matches(e), s.matches_partial(e));
        }

        #[test]
        fn negatives_exclude_cells(positive in any::<u64>(), negative in any::<u64>(), e in any::<u64>()) {
            let s = Signature { positive, negative };
            prop_assert_eq!(s.matches(e), positive & !e == 0 && negative & e == 0);
        }
    }
}
