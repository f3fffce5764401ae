// Index/barcode sequence helpers

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DNA {
    A,
    C,
    G,
    T,
    N,
}

impl DNA {
    /// Convert nucleotide to its character representation.
    pub fn to_char(&self) -> char {
        match self {
            DNA::A => 'A',
            DNA::C => 'C',
            DNA::G => 'G',
            DNA::T => 'T',
            DNA::N => 'N',
        }
    }

    pub fn from_char(c: char) -> Option<DNA> {
        match c.to_ascii_uppercase() {
            'A' => Some(DNA::A),
            'C' => Some(DNA::C),
            'G' => Some(DNA::G),
            'T' => Some(DNA::T),
            'N' => Some(DNA::N),
            _ => None,
        }
    }

    pub fn complement(&self) -> DNA {
        match self {
            DNA::A => DNA::T,
            DNA::C => DNA::G,
            DNA::G => DNA::C,
            DNA::T => DNA::A,
            DNA::N => DNA::N,
        }
    }
}

/// Reverse complement of an index sequence. Characters that are not
/// nucleotides are kept as-is, in reversed position.
pub fn reverse_complement(seq: &str) -> String {
    seq.chars()
        .rev()
        .map(|c| match DNA::from_char(c) {
            Some(base) => base.complement().to_char(),
            None => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_complement() {
        assert_eq!(reverse_complement("ACGTTN"), "NAACGT");
        assert_eq!(reverse_complement("acgg"), "CCGT");
        assert_eq!(reverse_complement(""), "");
    }
}
