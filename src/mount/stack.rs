use std::path::{Path, PathBuf};

/// One mount or bind performed during a mount sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Mounts in the order they were made; torn down in reverse.
#[derive(Debug, Default)]
pub struct MountStack {
    points: Vec<MountPoint>,
}

impl MountStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: &Path, target: &Path) {
        self.points.push(MountPoint {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
    }

    pub fn pop(&mut self) -> Option<MountPoint> {
        self.points.pop()
    }

    pub fn contains_target(&self, target: &Path) -> bool {
        self.points.iter().any(|p| p.target == target)
    }

    /// Mount targets, oldest first.
    pub fn targets(&self) -> Vec<PathBuf> {
        self.points.iter().map(|p| p.target.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_reverse_order() {
        let mut stack = MountStack::new();
        stack.push(Path::new("/src/a"), Path::new("/a"));
        stack.push(Path::new("/src/b"), Path::new("/b"));

        assert!(stack.contains_target(Path::new("/a")));
        assert_eq!(stack.pop().unwrap().target, PathBuf::from("/b"));
        assert_eq!(stack.pop().unwrap().target, PathBuf::from("/a"));
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }
}
