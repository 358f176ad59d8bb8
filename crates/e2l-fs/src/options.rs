//! Mount-option grammar: a comma-separated list of `errors=continue`,
//! `errors=panic`, `errors=remount-ro`, and `debug`. Each `errors=` choice
//! displaces the other two.

use e2l_error::{Ext2Error, Result};
use e2l_types::{ERRORS_CONTINUE, ERRORS_PANIC};

/// What to do when on-disk corruption is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Continue,
    RemountRo,
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    pub errors: ErrorPolicy,
    pub debug: bool,
}

impl MountOptions {
    /// Defaults from the superblock's `s_errors` policy field.
    #[must_use]
    pub fn from_sb_errors(errors: u16) -> Self {
        let errors = match errors {
            ERRORS_PANIC => ErrorPolicy::Panic,
            ERRORS_CONTINUE => ErrorPolicy::Continue,
            _ => ErrorPolicy::RemountRo,
        };
        Self {
            errors,
            debug: false,
        }
    }

    /// Apply a mount-option string on top of this set.
    pub fn parse(mut self, options: &str) -> Result<Self> {
        for token in options.split(',') {
            if token.is_empty() {
                continue;
            }
            match token {
                "errors=continue" => self.errors = ErrorPolicy::Continue,
                "errors=panic" => self.errors = ErrorPolicy::Panic,
                "errors=remount-ro" => self.errors = ErrorPolicy::RemountRo,
                "debug" => self.debug = true,
                _ => return Err(Ext2Error::InvalidInput("unrecognized mount option")),
            }
        }
        Ok(self)
    }

    /// Render the active option set back into the grammar.
    ///
    /// `default_errors` is the superblock's policy field: `errors=remount-ro`
    /// is only shown when it overrides a different on-disk default.
    #[must_use]
    pub fn show(&self, default_errors: u16) -> String {
        let mut out = String::new();
        match self.errors {
            ErrorPolicy::RemountRo => {
                if default_errors == ERRORS_PANIC || default_errors == ERRORS_CONTINUE {
                    out.push_str(",errors=remount-ro");
                }
            }
            ErrorPolicy::Continue => out.push_str(",errors=continue"),
            ErrorPolicy::Panic => out.push_str(",errors=panic"),
        }
        if self.debug {
            out.push_str(",debug");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2l_types::ERRORS_RO;

    #[test]
    fn defaults_follow_superblock_field() {
        assert_eq!(
            MountOptions::from_sb_errors(ERRORS_PANIC).errors,
            ErrorPolicy::Panic
        );
        assert_eq!(
            MountOptions::from_sb_errors(ERRORS_CONTINUE).errors,
            ErrorPolicy::Continue
        );
        assert_eq!(
            MountOptions::from_sb_errors(ERRORS_RO).errors,
            ErrorPolicy::RemountRo
        );
        assert_eq!(MountOptions::from_sb_errors(0).errors, ErrorPolicy::RemountRo);
    }

    #[test]
    fn errors_choices_displace_each_other() {
        let opts = MountOptions::from_sb_errors(0)
            .parse("errors=panic,errors=continue")
            .unwrap();
        assert_eq!(opts.errors, ErrorPolicy::Continue);

        let opts = MountOptions::from_sb_errors(ERRORS_CONTINUE)
            .parse("errors=remount-ro,debug")
            .unwrap();
        assert_eq!(opts.errors, ErrorPolicy::RemountRo);
        assert!(opts.debug);
    }

    #[test]
    fn empty_tokens_are_skipped() {
        let opts = MountOptions::from_sb_errors(0).parse(",,debug,").unwrap();
        assert!(opts.debug);
    }

    #[test]
    fn unknown_option_is_invalid() {
        assert!(MountOptions::from_sb_errors(0).parse("noatime").is_err());
    }

    #[test]
    fn show_round_trips_the_grammar() {
        let opts = MountOptions {
            errors: ErrorPolicy::Panic,
            debug: true,
        };
        assert_eq!(opts.show(ERRORS_RO), ",errors=panic,debug");

        let ro = MountOptions {
            errors: ErrorPolicy::RemountRo,
            debug: false,
        };
        // Matching the on-disk default: nothing to show.
        assert_eq!(ro.show(ERRORS_RO), "");
        // Overriding a different default: shown.
        assert_eq!(ro.show(ERRORS_PANIC), ",errors=remount-ro");
    }
}
