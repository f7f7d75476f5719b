use crate::protocol::Camera;

/// Cameras announced by the peer, in announcement order. Ids are unique.
#[derive(Debug, Default, Clone)]
pub struct CameraRegistry {
    cameras: Vec<Camera>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a camera. Returns false (and changes nothing) if the id is known.
    pub fn insert(&mut self, camera: Camera) -> bool {
        if self.contains(camera.id) {
            return false;
        }
        self.cameras.push(camera);
        true
    }

    pub fn contains(&self, id: i32) -> bool {
        self.cameras.iter().any(|c| c.id == id)
    }

    #[cfg(test)]
    pub fn get(&self, id: i32) -> Option<&Camera> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn clear(&mut self) {
        self.cameras.clear();
    }
}
