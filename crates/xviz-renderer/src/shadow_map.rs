//! Depth-only render target of one shadow-casting light.

use glam::Mat4;

use crate::backend::{DepthTargetId, GpuBackend, PassTarget};
use crate::error::RenderError;

/// Texture unit and depth target a color pass samples a shadow map through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowBinding {
    pub unit: u32,
    pub target: DepthTargetId,
}

/// One shadow map, created when its light is first seen.
#[derive(Debug)]
pub struct ShadowMap {
    target: DepthTargetId,
    width: u32,
    height: u32,
    /// World to shadow clip space for the current frame.
    pub light_space: Mat4,
    bound: bool,
}

impl ShadowMap {
    /// Allocates the depth target.
    pub fn init<B: GpuBackend + ?Sized>(backend: &mut B, width: u32, height: u32) -> Result<Self, RenderError> {
        let target = backend.create_depth_target(width, height)?;
        tracing::info!("Created {}x{} shadow map", width, height);
        Ok(Self {
            target,
            width,
            height,
            light_space: Mat4::IDENTITY,
            bound: false,
        })
    }

    pub fn target(&self) -> DepthTargetId {
        self.target
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Starts a depth pass into this map, clearing it to the far plane.
    pub fn bind<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<(), RenderError> {
        backend.begin_pass(PassTarget::Depth(self.target))?;
        self.bound = true;
        Ok(())
    }

    /// Ends the depth pass; drawing returns to the default target.
    pub fn unbind<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<(), RenderError> {
        self.bound = false;
        backend.end_pass()?;
        Ok(())
    }

    /// Binding of this map at texture unit `slot` for the color pass.
    pub fn bind_texture(&self, slot: u32) -> ShadowBinding {
        ShadowBinding {
            unit: slot,
            target: self.target,
        }
    }

    /// Frees the depth target.
    pub fn release<B: GpuBackend + ?Sized>(self, backend: &mut B) {
        backend.destroy_depth_target(self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn test_bind_unbind_runs_one_depth_pass() {
        let mut backend = MockBackend::new();
        let mut map = ShadowMap::init(&mut backend, 1024, 1024).unwrap();
        assert_eq!(map.size(), (1024, 1024));

        map.bind(&mut backend).unwrap();
        assert!(map.is_bound());
        map.unbind(&mut backend).unwrap();
        assert!(!map.is_bound());
        assert_eq!(backend.passes, vec![PassTarget::Depth(map.target())]);
        assert_eq!(
            map.bind_texture(2),
            ShadowBinding {
                unit: 2,
                target: map.target()
            }
        );

        map.release(&mut backend);
        assert!(backend.depth_targets.is_empty());
    }

    #[test]
    fn test_unbind_without_bind_fails() {
        let mut backend = MockBackend::new();
        let mut map = ShadowMap::init(&mut backend, 256, 256).unwrap();
        assert!(map.unbind(&mut backend).is_err());
    }
}
