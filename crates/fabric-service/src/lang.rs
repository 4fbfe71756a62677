// SPDX-License-Identifier: Apache-2.0
//! The fifteen recognized languages and their engine-row assignments.
//!
//! Letters `a`-`o` are permanent addresses, not display labels: `a` is the
//! primary row (64 positions), every other row gets 16. Total addressable
//! capacity is `64 + 14*16 = 288` slots.

/// One of the fifteen languages recognized by the execution matrix.
///
/// Variant order is the canonical letter order (`a`..`o`) and must not
/// change — it is relied on by [`LanguageId::ALL`] and by row-major slot
/// address assignment in the node registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LanguageId {
    /// `a` — primary row, 64 positions.
    Python,
    /// `b`
    JavaScript,
    /// `c`
    TypeScript,
    /// `d`
    Rust,
    /// `e`
    Java,
    /// `f`
    Swift,
    /// `g`
    Cpp,
    /// `h`
    R,
    /// `i`
    Go,
    /// `j`
    Ruby,
    /// `k`
    CSharp,
    /// `l`
    Kotlin,
    /// `m`
    C,
    /// `n`
    Bash,
    /// `o`
    Perl,
}

/// Row capacity for the primary engine (`a`).
pub const PRIMARY_ROW_CAPACITY: u32 = 64;
/// Row capacity for every non-primary engine.
pub const SECONDARY_ROW_CAPACITY: u32 = 16;
/// Total addressable slot capacity across all rows (`64 + 14*16`).
pub const TOTAL_CAPACITY: u32 = PRIMARY_ROW_CAPACITY + 14 * SECONDARY_ROW_CAPACITY;

impl LanguageId {
    /// All fifteen languages in letter order (`a`..`o`).
    pub const ALL: [LanguageId; 15] = [
        LanguageId::Python,
        LanguageId::JavaScript,
        LanguageId::TypeScript,
        LanguageId::Rust,
        LanguageId::Java,
        LanguageId::Swift,
        LanguageId::Cpp,
        LanguageId::R,
        LanguageId::Go,
        LanguageId::Ruby,
        LanguageId::CSharp,
        LanguageId::Kotlin,
        LanguageId::C,
        LanguageId::Bash,
        LanguageId::Perl,
    ];

    /// The single-letter engine row address (`a`..`o`).
    pub const fn letter(self) -> char {
        match self {
            LanguageId::Python => 'a',
            LanguageId::JavaScript => 'b',
            LanguageId::TypeScript => 'c',
            LanguageId::Rust => 'd',
            LanguageId::Java => 'e',
            LanguageId::Swift => 'f',
            LanguageId::Cpp => 'g',
            LanguageId::R => 'h',
            LanguageId::Go => 'i',
            LanguageId::Ruby => 'j',
            LanguageId::CSharp => 'k',
            LanguageId::Kotlin => 'l',
            LanguageId::C => 'm',
            LanguageId::Bash => 'n',
            LanguageId::Perl => 'o',
        }
    }

    /// Canonical lowercase name, as used in payloads and snippet directories.
    pub const fn canonical(self) -> &'static str {
        match self {
            LanguageId::Python => "python",
            LanguageId::JavaScript => "javascript",
            LanguageId::TypeScript => "typescript",
            LanguageId::Rust => "rust",
            LanguageId::Java => "java",
            LanguageId::Swift => "swift",
            LanguageId::Cpp => "cpp",
            LanguageId::R => "r",
            LanguageId::Go => "go",
            LanguageId::Ruby => "ruby",
            LanguageId::CSharp => "csharp",
            LanguageId::Kotlin => "kotlin",
            LanguageId::C => "c",
            LanguageId::Bash => "bash",
            LanguageId::Perl => "perl",
        }
    }

    /// Upper-case engine name, as stored on `Slot::engine_name`.
    pub fn engine_name(self) -> String {
        self.canonical().to_ascii_uppercase()
    }

    /// Source file extension (including the leading dot) for promoted snippets.
    pub const fn extension(self) -> &'static str {
        match self {
            LanguageId::Python => ".py",
            LanguageId::JavaScript => ".js",
            LanguageId::TypeScript => ".ts",
            LanguageId::Rust => ".rs",
            LanguageId::Java => ".java",
            LanguageId::Swift => ".swift",
            LanguageId::Cpp => ".cpp",
            LanguageId::R => ".r",
            LanguageId::Go => ".go",
            LanguageId::Ruby => ".rb",
            LanguageId::CSharp => ".cs",
            LanguageId::Kotlin => ".kt",
            LanguageId::C => ".c",
            LanguageId::Bash => ".sh",
            LanguageId::Perl => ".pl",
        }
    }

    /// Declared slot capacity of this language's engine row.
    pub const fn capacity(self) -> u32 {
        match self {
            LanguageId::Python => PRIMARY_ROW_CAPACITY,
            _ => SECONDARY_ROW_CAPACITY,
        }
    }

    /// Whether this is the in-process engine (shared-namespace executor).
    pub const fn is_in_process(self) -> bool {
        matches!(self, LanguageId::Python)
    }

    /// Single-line comment token, used to prefix promoted snippet files
    /// with a metadata header in a language-appropriate way.
    pub const fn comment_prefix(self) -> &'static str {
        match self {
            LanguageId::Python | LanguageId::R | LanguageId::Ruby | LanguageId::Bash | LanguageId::Perl => "#",
            _ => "//",
        }
    }

    /// Look up a language by its engine letter (`a`..`o`, case-insensitive).
    pub fn from_letter(letter: char) -> Option<Self> {
        let letter = letter.to_ascii_lowercase();
        Self::ALL.into_iter().find(|l| l.letter() == letter)
    }

    /// Look up a language by its canonical name (case-insensitive, trimmed).
    pub fn from_name(name: &str) -> Option<Self> {
        let needle = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|l| l.canonical() == needle)
    }
}

impl std::fmt::Display for LanguageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.canonical())
    }
}

/// Resolve an engine from either its letter or its language name, trying the
/// letter first and falling back to the language string.
pub fn resolve_engine(engine_letter: &str, language: &str) -> Option<LanguageId> {
    engine_letter
        .chars()
        .next()
        .and_then(LanguageId::from_letter)
        .or_else(|| LanguageId::from_name(language))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_capacity_is_288() {
        assert_eq!(TOTAL_CAPACITY, 288);
    }

    #[test]
    fn letters_are_a_through_o_in_order() {
        let letters: Vec<char> = LanguageId::ALL.iter().map(|l| l.letter()).collect();
        assert_eq!(letters, ('a'..='o').collect::<Vec<_>>());
    }

    #[test]
    fn python_is_primary_and_in_process() {
        assert_eq!(LanguageId::Python.capacity(), 64);
        assert!(LanguageId::Python.is_in_process());
        for lang in LanguageId::ALL.into_iter().filter(|l| *l != LanguageId::Python) {
            assert_eq!(lang.capacity(), 16);
            assert!(!lang.is_in_process());
        }
    }

    #[test]
    fn from_letter_and_from_name_roundtrip() {
        for lang in LanguageId::ALL {
            assert_eq!(LanguageId::from_letter(lang.letter()), Some(lang));
            assert_eq!(LanguageId::from_name(lang.canonical()), Some(lang));
            assert_eq!(LanguageId::from_name(&lang.canonical().to_ascii_uppercase()), Some(lang));
        }
        assert_eq!(LanguageId::from_letter('z'), None);
        assert_eq!(LanguageId::from_name("cobol"), None);
    }

    #[test]
    fn resolve_engine_prefers_letter() {
        // letter wins even if language string disagrees
        assert_eq!(resolve_engine("a", "rust"), Some(LanguageId::Python));
        assert_eq!(resolve_engine("", "go"), Some(LanguageId::Go));
        assert_eq!(resolve_engine("", "nope"), None);
    }
}
