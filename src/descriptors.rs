use std::rc::Rc;

use anyhow::Result;
use log::*;
use vulkanalia::prelude::v1_0::*;

use crate::config::{OVERLAY_DESCRIPTOR_SLACK, OVERLAY_SET_SLACK};
use crate::device::DeviceContext;
use crate::error::RenderError;

/// Descriptor pool capacity for `frames` frame slots and `models` models.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSizing {
    pub frames: usize,
    pub models: usize,
    pub pool_sizes: Vec<(vk::DescriptorType, u32)>,
    pub max_sets: u32,
}

impl PoolSizing {
    /// An empty scene is sized as if it held one model.
    pub fn new(frames: usize, models: usize) -> Result<Self, RenderError> {
        let capacity = frames * models.max(1);
        if capacity == 0 {
            return Err(RenderError::DescriptorPoolExhausted { frames, models });
        }
        let capacity = capacity as u32;
        Ok(Self {
            frames,
            models,
            pool_sizes: vec![
                (vk::DescriptorType::UNIFORM_BUFFER, capacity),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, capacity + OVERLAY_DESCRIPTOR_SLACK),
                (vk::DescriptorType::SAMPLED_IMAGE, OVERLAY_DESCRIPTOR_SLACK),
                (vk::DescriptorType::STORAGE_IMAGE, OVERLAY_DESCRIPTOR_SLACK),
                (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, OVERLAY_DESCRIPTOR_SLACK),
                (vk::DescriptorType::INPUT_ATTACHMENT, OVERLAY_DESCRIPTOR_SLACK),
            ],
            max_sets: capacity + OVERLAY_SET_SLACK,
        })
    }

}

/// Position of the (frame, model) set in the flat set list.
pub fn set_index(frame: usize, model: usize, model_count: usize) -> usize {
    frame * model_count + model
}

/// Pool sizing plus the (frame, model) pair each allocated set is written for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetPlan {
    pub sizing: PoolSizing,
    pub writes: Vec<(usize, usize)>,
}

impl SetPlan {
    /// Plans a fresh pool for `frames` slots and `models` models.
    pub fn new(frames: usize, models: usize) -> Result<Self, RenderError> {
        let sizing = PoolSizing::new(frames, models)?;
        let writes = (0..frames)
            .flat_map(|frame| (0..models).map(move |model| (frame, model)))
            .collect::<Vec<_>>();
        if writes.len() > sizing.max_sets as usize {
            return Err(RenderError::DescriptorPoolExhausted { frames, models });
        }
        Ok(Self { sizing, writes })
    }

    pub fn set_count(&self) -> usize {
        self.writes.len()
    }
}

/// Set for (frame, model), if one was allocated.
pub fn lookup_set(
    sets: &[vk::DescriptorSet],
    frame: usize,
    model: usize,
    model_count: usize,
) -> Option<vk::DescriptorSet> {
    if model >= model_count {
        return None;
    }
    sets.get(set_index(frame, model, model_count)).copied()
}

/// Texture handles bound at binding 1 of a model's sets.
#[derive(Copy, Clone, Debug)]
pub struct TextureBinding {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Owns the descriptor pool and one set per (frame, model).
pub struct DescriptorManager {
    ctx: Rc<DeviceContext>,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    sizing: PoolSizing,
}

impl DescriptorManager {
    pub unsafe fn create(
        ctx: &Rc<DeviceContext>,
        layout: vk::DescriptorSetLayout,
        uniform_buffers: &[vk::Buffer],
        textures: &[TextureBinding],
    ) -> Result<Self> {
        let mut manager = Self {
            ctx: ctx.clone(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            sizing: PoolSizing::new(uniform_buffers.len(), textures.len())?,
        };
        manager.rebuild(layout, uniform_buffers, textures)?;
        Ok(manager)
    }

    /// Replaces the pool and reallocates every set for the current frames and models.
    ///
    /// The device must be idle: sets of the old pool may still be referenced by
    /// recorded command buffers otherwise.
    pub unsafe fn rebuild(
        &mut self,
        layout: vk::DescriptorSetLayout,
        uniform_buffers: &[vk::Buffer],
        textures: &[TextureBinding],
    ) -> Result<()> {
        let plan = SetPlan::new(uniform_buffers.len(), textures.len())?;

        let device = self.ctx.device();
        device.destroy_descriptor_pool(self.pool, None);
        self.pool = vk::DescriptorPool::null();
        self.sets.clear();

        self.pool = self.create_pool(&plan.sizing)?;
        self.sizing = plan.sizing.clone();

        if plan.set_count() == 0 {
            debug!("No models loaded; descriptor pool left empty.");
            return Ok(());
        }

        let layouts = vec![layout; plan.set_count()];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = device.allocate_descriptor_sets(&info)?;

        let model_count = textures.len();
        for (frame, model) in &plan.writes {
            let set = sets[set_index(*frame, *model, model_count)];
            self.write_set(set, uniform_buffers[*frame], textures[*model]);
        }
        self.sets = sets;

        debug!(
            "Allocated {} descriptor sets ({} frames x {} models).",
            self.sets.len(),
            self.sizing.frames,
            model_count
        );
        Ok(())
    }

    /// `None` when the last rebuild failed to allocate.
    pub fn set(&self, frame: usize, model: usize) -> Option<vk::DescriptorSet> {
        lookup_set(&self.sets, frame, model, self.sizing.models)
    }

    /// Pool shared with the overlay; replaced on every rebuild.
    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn live_sets(&self) -> usize {
        self.sets.len()
    }

    unsafe fn create_pool(&self, sizing: &PoolSizing) -> Result<vk::DescriptorPool> {
        let pool_sizes = sizing
            .pool_sizes
            .iter()
            .map(|(ty, count)| vk::DescriptorPoolSize::builder().type_(*ty).descriptor_count(*count))
            .collect::<Vec<_>>();
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(&pool_sizes)
            .max_sets(sizing.max_sets);
        Ok(self.ctx.device().create_descriptor_pool(&info, None)?)
    }

    unsafe fn write_set(&self, set: vk::DescriptorSet, uniform_buffer: vk::Buffer, texture: TextureBinding) {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(uniform_buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE as u64);
        let buffer_info = &[info];
        let ubo_write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(buffer_info);

        let info = vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(texture.view)
            .sampler(texture.sampler);
        let image_info = &[info];
        let sampler_write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(1)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(image_info);

        self.ctx
            .device()
            .update_descriptor_sets(&[ubo_write, sampler_write], &[] as &[vk::CopyDescriptorSet]);
    }
}

impl Drop for DescriptorManager {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use vulkanalia::vk::Handle;

    use super::*;

    fn descriptors_of(sizing: &PoolSizing, ty: vk::DescriptorType) -> u32 {
        sizing
            .pool_sizes
            .iter()
            .filter(|(t, _)| *t == ty)
            .map(|(_, n)| *n)
            .sum()
    }

    #[test]
    fn pool_covers_every_frame_model_pair_plus_slack() {
        let plan = SetPlan::new(2, 3).unwrap();
        let sizing = &plan.sizing;
        assert_eq!(plan.set_count(), 6);
        assert_eq!(descriptors_of(sizing, vk::DescriptorType::UNIFORM_BUFFER), 6);
        assert_eq!(
            descriptors_of(sizing, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            6 + OVERLAY_DESCRIPTOR_SLACK
        );
        assert_eq!(descriptors_of(sizing, vk::DescriptorType::INPUT_ATTACHMENT), OVERLAY_DESCRIPTOR_SLACK);
        assert_eq!(sizing.max_sets, 6 + OVERLAY_SET_SLACK);
    }

    #[test]
    fn empty_scene_still_gets_a_pool() {
        let plan = SetPlan::new(2, 0).unwrap();
        assert_eq!(plan.set_count(), 0);
        assert_eq!(descriptors_of(&plan.sizing, vk::DescriptorType::UNIFORM_BUFFER), 2);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            PoolSizing::new(0, 4),
            Err(RenderError::DescriptorPoolExhausted { frames: 0, models: 4 })
        ));
    }

    #[test]
    fn sets_are_laid_out_frame_major() {
        assert_eq!(set_index(0, 0, 3), 0);
        assert_eq!(set_index(0, 2, 3), 2);
        assert_eq!(set_index(1, 0, 3), 3);
        assert_eq!(set_index(1, 2, 3), 5);
    }

    #[test]
    fn model_churn_keeps_one_set_per_frame_and_model() {
        let frames = 2;
        for models in [1, 2, 3, 4, 5, 4, 2, 0, 1, 3] {
            let plan = SetPlan::new(frames, models).unwrap();
            assert_eq!(plan.set_count(), frames * models);
            assert!(plan.set_count() <= plan.sizing.max_sets as usize);

            let mut slots = plan
                .writes
                .iter()
                .map(|(frame, model)| set_index(*frame, *model, models))
                .collect::<Vec<_>>();
            slots.sort_unstable();
            assert_eq!(slots, (0..frames * models).collect::<Vec<_>>());
        }
    }

    #[test]
    fn missing_sets_are_not_looked_up() {
        let sets = (1..=4).map(vk::DescriptorSet::from_raw).collect::<Vec<_>>();
        assert_eq!(lookup_set(&sets, 1, 0, 2), Some(vk::DescriptorSet::from_raw(3)));
        assert_eq!(lookup_set(&sets, 0, 2, 2), None);
        assert_eq!(lookup_set(&[], 0, 0, 2), None);
        assert_eq!(lookup_set(&sets[..2], 1, 1, 2), None);
    }
}
