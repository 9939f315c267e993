//! Targeted in-place text patching.
//!
//! Patches carry byte offsets into the original source. Applying them
//! splices only the patched ranges, leaving all surrounding whitespace,
//! comments and string literals byte-identical.

/// Replace `[start, end)` of the source with `text`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Patch {
    pub fn new(start: usize, end: usize, text: impl Into<String>) -> Patch {
        Patch { start, end, text: text.into() }
    }
}

/// Apply non-overlapping patches to the source. Patches are sorted by start
/// offset; any patch overlapping a prior one is skipped.
pub fn apply_patches(src: &str, mut patches: Vec<Patch>) -> String {
    patches.sort_by_key(|p| p.start);
    let mut out = String::with_capacity(src.len());
    let mut cursor = 0;
    for patch in patches {
        if patch.start < cursor || patch.end > src.len() || patch.end < patch.start {
            continue;
        }
        out.push_str(&src[cursor..patch.start]);
        out.push_str(&patch.text);
        cursor = patch.end;
    }
    out.push_str(&src[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_patches_preserves_surroundings() {
        let src = "alpha beta gamma";
        let out = apply_patches(
            src,
            vec![Patch::new(6, 10, "BETA"), Patch::new(0, 5, "A")],
        );
        assert_eq!(out, "A BETA gamma");
    }

    #[test]
    fn test_overlapping_patch_skipped() {
        let src = "abcdef";
        let out = apply_patches(src, vec![Patch::new(0, 4, "x"), Patch::new(2, 6, "y")]);
        assert_eq!(out, "xef");
    }

    #[test]
    fn test_empty_patches() {
        assert_eq!(apply_patches("unchanged", vec![]), "unchanged");
    }
}
