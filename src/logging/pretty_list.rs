use std::fmt;

/// Formats a slice as a markdown-style list with one entry per line.
///
/// Used for list-valued debug logs such as the formats and present modes a
/// surface supports. The alternate flag (`{:#?}`) pretty-prints each entry.
pub struct PrettyList<'data, T>(pub &'data [T]);

impl<T> PrettyList<'_, T> {
    fn write_entries(
        &self,
        f: &mut fmt::Formatter<'_>,
        mut write_entry: impl FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
    ) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(" (none)\n");
        }
        f.write_str("\n")?;
        for entry in self.0 {
            f.write_str("- ")?;
            write_entry(f, entry)?;
            f.write_str("\n")?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug> fmt::Debug for PrettyList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alternate = f.alternate();
        self.write_entries(f, |f, entry| {
            if alternate {
                write!(f, "{:#?}", entry)
            } else {
                write!(f, "{:?}", entry)
            }
        })
    }
}

impl<T: fmt::Display> fmt::Display for PrettyList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_entries(f, |f, entry| write!(f, "{}", entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_entry_gets_its_own_line() {
        assert_eq!(format!("{:?}", PrettyList(&[1, 2, 3])), "\n- 1\n- 2\n- 3\n");
        assert_eq!(format!("{}", PrettyList(&["a", "b"])), "\n- a\n- b\n");
    }

    #[test]
    fn empty_lists_say_so() {
        let empty: [u32; 0] = [];

        assert_eq!(format!("{:?}", PrettyList(&empty)), " (none)\n");
    }
}
