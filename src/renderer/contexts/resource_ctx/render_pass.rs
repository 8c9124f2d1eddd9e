use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use color_eyre::Result;

use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::internals::registry::Registry;
use crate::renderer::sync_policy::SyncPolicy;

slotmap::new_key_type! {
    pub struct RenderPassKey;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputAttachmentFormat {
    Color,
    Depth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderPass {
    key: RenderPassKey,
    handle: vk::RenderPass,
}

impl RenderPass {
    pub fn is_valid(&self) -> bool {
        self.handle != vk::RenderPass::null()
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubpassLayout {
    pub index: u32,
    pub color: Vec<vk::AttachmentReference>,
    pub input: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
    /// Single-sample resolve target of the color attachment.
    pub msaa: Option<vk::AttachmentReference>,
}

impl SubpassLayout {
    fn stages_and_access(&self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        let mut stages = vk::PipelineStageFlags::empty();
        let mut access = vk::AccessFlags::empty();

        if !self.color.is_empty() || self.msaa.is_some() {
            stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
        if self.depth.is_some() {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        if !self.input.is_empty() {
            stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
            access |= vk::AccessFlags::INPUT_ATTACHMENT_READ;
        }
        (stages, access)
    }
}

/// Everything needed to create a native render pass, in subpass order.
#[derive(Clone, Debug, Default)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassLayout>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

/// Turns a finished [`RenderPassLayout`] into a render pass.
pub trait RenderPassSink {
    fn make_render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPass>;
}

fn dependency_between(src: &SubpassLayout, dst: &SubpassLayout) -> Option<vk::SubpassDependency> {
    let mut src_stages = vk::PipelineStageFlags::empty();
    let mut src_access = vk::AccessFlags::empty();
    let mut dst_stages = vk::PipelineStageFlags::empty();
    let mut dst_access = vk::AccessFlags::empty();

    let src_writes_color = !src.color.is_empty() || src.msaa.is_some();
    let depth_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;

    if !dst.input.is_empty() {
        if src_writes_color {
            src_stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            src_access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
        if src.depth.is_some() {
            src_stages |= depth_tests;
            src_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        if src_writes_color || src.depth.is_some() {
            dst_stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
            dst_access |= vk::AccessFlags::INPUT_ATTACHMENT_READ;
        }
    }
    if !src.color.is_empty() && !dst.color.is_empty() {
        src_stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        src_access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        dst_stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        dst_access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if src.depth.is_some() && dst.depth.is_some() {
        src_stages |= depth_tests;
        src_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        dst_stages |= depth_tests;
        dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    if src_stages.is_empty() {
        return None;
    }

    Some(vk::SubpassDependency {
        src_subpass: src.index,
        dst_subpass: dst.index,
        src_stage_mask: src_stages,
        dst_stage_mask: dst_stages,
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        dependency_flags: vk::DependencyFlags::empty(),
    })
}

fn sample_count(samples: u32) -> vk::SampleCountFlags {
    debug_assert!(samples.is_power_of_two() && samples <= 64, "invalid sample count {samples}");
    vk::SampleCountFlags::from_raw(samples)
}

pub struct RenderPassBuilder<'a, F: RenderPassSink + ?Sized> {
    sink: &'a F,
    color_format: vk::Format,
    depth_format: vk::Format,
    attachments: Vec<vk::AttachmentDescription>,
    dependencies: Vec<vk::SubpassDependency>,
    subpasses: Vec<SubpassLayout>,
    names: HashMap<String, usize>,
}

impl<'a, F: RenderPassSink + ?Sized> RenderPassBuilder<'a, F> {
    pub fn new(sink: &'a F, color_format: vk::Format, depth_format: vk::Format) -> Self {
        Self {
            sink,
            color_format,
            depth_format,
            attachments: Vec::new(),
            dependencies: Vec::new(),
            subpasses: Vec::new(),
            names: HashMap::new(),
        }
    }

    pub fn begin_subpass(self, name: &str) -> SubpassBuilder<'a, F> {
        debug_assert!(!name.is_empty());
        debug_assert!(!self.names.contains_key(name), "subpass {name} declared twice");

        let info = SubpassLayout {
            index: self.subpasses.len() as u32,
            ..Default::default()
        };
        SubpassBuilder {
            parent: self,
            name: name.to_owned(),
            info,
            attachments: Vec::new(),
            dependencies: Vec::new(),
            baked: false,
        }
    }

    /// Assembles the final layout: external dependencies around the first and last
    /// subpass, and the presentable output of the last subpass.
    pub fn finish(mut self) -> RenderPassLayout {
        debug_assert!(!self.subpasses.is_empty(), "render pass without subpasses");

        if let (Some(first), Some(last)) = (self.subpasses.first(), self.subpasses.last()) {
            let (first_stages, first_access) = first.stages_and_access();
            let (last_stages, last_access) = last.stages_and_access();

            self.dependencies.push(vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: first.index,
                src_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                dst_stage_mask: first_stages,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: first_access,
                dependency_flags: vk::DependencyFlags::empty(),
            });
            self.dependencies.push(vk::SubpassDependency {
                src_subpass: last.index,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: last_stages,
                dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                src_access_mask: last_access,
                dst_access_mask: vk::AccessFlags::empty(),
                dependency_flags: vk::DependencyFlags::empty(),
            });

            let presented = last.msaa.or_else(|| last.color.last().copied());
            if let Some(reference) = presented {
                self.attachments[reference.attachment as usize].final_layout =
                    vk::ImageLayout::PRESENT_SRC_KHR;
            }
        }

        RenderPassLayout {
            attachments: self.attachments,
            subpasses: self.subpasses,
            dependencies: self.dependencies,
        }
    }

    pub fn confirm(self) -> Result<RenderPass> {
        let sink = self.sink;
        let layout = self.finish();
        sink.make_render_pass(&layout)
    }
}

pub struct SubpassBuilder<'a, F: RenderPassSink + ?Sized> {
    parent: RenderPassBuilder<'a, F>,
    name: String,
    info: SubpassLayout,
    attachments: Vec<vk::AttachmentDescription>,
    dependencies: Vec<vk::SubpassDependency>,
    /// Set once dependencies or a resolve target are declared.
    baked: bool,
}

impl<'a, F: RenderPassSink + ?Sized> SubpassBuilder<'a, F> {
    fn next_index(&self) -> u32 {
        (self.parent.attachments.len() + self.attachments.len()) as u32
    }

    fn push(&mut self, description: vk::AttachmentDescription, layout: vk::ImageLayout) -> vk::AttachmentReference {
        debug_assert!(!self.baked, "attachments declared after dependencies");
        let reference = vk::AttachmentReference {
            attachment: self.next_index(),
            layout,
        };
        self.attachments.push(description);
        reference
    }

    pub fn color_attachment(mut self, samples: u32) -> Self {
        let description = vk::AttachmentDescription::default()
            .format(self.parent.color_format)
            .samples(sample_count(samples))
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let reference = self.push(description, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        self.info.color.push(reference);
        self
    }

    pub fn depth_attachment(mut self, samples: u32) -> Self {
        debug_assert!(self.info.depth.is_none(), "subpass already has a depth attachment");
        let description = vk::AttachmentDescription::default()
            .format(self.parent.depth_format)
            .samples(sample_count(samples))
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        let reference = self.push(description, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        self.info.depth = Some(reference);
        self
    }

    /// Resolve target for a multisampled color attachment.
    pub fn msaa_attachment(mut self) -> Self {
        debug_assert!(self.info.color.len() == 1, "resolve needs exactly one color attachment");
        let description = vk::AttachmentDescription::default()
            .format(self.parent.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let reference = self.push(description, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        self.info.msaa = Some(reference);
        self.baked = true;
        self
    }

    pub fn input_attachment(mut self, format: InputAttachmentFormat) -> Self {
        let format = match format {
            InputAttachmentFormat::Color => self.parent.color_format,
            InputAttachmentFormat::Depth => self.parent.depth_format,
        };
        let description = vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let reference = self.push(description, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        self.info.input.push(reference);
        self
    }

    /// Makes this subpass wait for the outputs of an earlier one.
    pub fn depend_on(mut self, name: &str) -> Self {
        let source = self.parent.names.get(name).map(|&i| &self.parent.subpasses[i]);
        debug_assert!(source.is_some(), "unknown subpass {name}");

        match source {
            Some(source) => {
                if let Some(dependency) = dependency_between(source, &self.info) {
                    self.dependencies.push(dependency);
                }
            }
            None => log::warn!("Ignoring dependency on unknown subpass {}", name),
        }
        self.baked = true;
        self
    }

    pub fn end_subpass(self) -> RenderPassBuilder<'a, F> {
        debug_assert!(!self.attachments.is_empty(), "subpass without attachments");

        let SubpassBuilder {
            mut parent,
            name,
            info,
            attachments,
            dependencies,
            ..
        } = self;
        parent.attachments.extend(attachments);
        parent.dependencies.extend(dependencies);
        parent.names.insert(name, parent.subpasses.len());
        parent.subpasses.push(info);
        parent
    }
}

pub struct RenderPassFactory<S: SyncPolicy> {
    passes: Registry<RenderPassKey, vk::RenderPass, S>,
    device_ctx: Arc<DeviceContext>,
}

impl<S: SyncPolicy> RenderPassFactory<S> {
    pub fn new(device_ctx: Arc<DeviceContext>) -> Self {
        Self {
            passes: Registry::new(),
            device_ctx,
        }
    }

    pub fn build_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> RenderPassBuilder<'_, Self> {
        RenderPassBuilder::new(self, color_format, depth_format)
    }

    pub fn destroy_render_pass(&self, render_pass: RenderPass) {
        debug_assert!(render_pass.is_valid());
        let handle = self.passes.remove(render_pass.key);
        debug_assert!(handle.is_some(), "render pass destroyed twice");
        if let Some(handle) = handle {
            unsafe { self.device_ctx.device().destroy_render_pass(handle, None) };
        }
    }

    pub fn is_live(&self, render_pass: &RenderPass) -> bool {
        self.passes.contains(render_pass.key)
    }
}

impl<S: SyncPolicy> RenderPassSink for RenderPassFactory<S> {
    fn make_render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPass> {
        let descriptions = layout
            .subpasses
            .iter()
            .map(|info| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&info.input)
                    .color_attachments(&info.color);
                if let Some(msaa) = &info.msaa {
                    description = description.resolve_attachments(std::slice::from_ref(msaa));
                }
                if let Some(depth) = &info.depth {
                    description = description.depth_stencil_attachment(depth);
                }
                description
            })
            .collect::<Vec<_>>();

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&layout.attachments)
            .subpasses(&descriptions)
            .dependencies(&layout.dependencies);

        let handle = unsafe { self.device_ctx.device().create_render_pass(&info, None)? };
        let key = self.passes.insert(handle);
        Ok(RenderPass { key, handle })
    }
}

impl<S: SyncPolicy> Drop for RenderPassFactory<S> {
    fn drop(&mut self) {
        for handle in self.passes.drain() {
            unsafe { self.device_ctx.device().destroy_render_pass(handle, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use ash::vk::Handle;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        layouts: RefCell<Vec<RenderPassLayout>>,
    }

    impl RenderPassSink for RecordingSink {
        fn make_render_pass(&self, layout: &RenderPassLayout) -> Result<RenderPass> {
            self.layouts.borrow_mut().push(layout.clone());
            Ok(RenderPass {
                key: RenderPassKey::default(),
                handle: vk::RenderPass::from_raw(1),
            })
        }
    }

    const COLOR: vk::Format = vk::Format::B8G8R8A8_SRGB;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    #[test]
    fn single_subpass_is_bracketed_and_presentable() {
        let sink = RecordingSink::default();
        let pass = RenderPassBuilder::new(&sink, COLOR, DEPTH)
            .begin_subpass("main")
            .color_attachment(1)
            .depth_attachment(1)
            .end_subpass()
            .confirm()
            .unwrap();
        assert!(pass.is_valid());

        let layouts = sink.layouts.borrow();
        let layout = &layouts[0];
        assert_eq!(layout.attachments.len(), 2);
        assert_eq!(layout.attachments[0].format, COLOR);
        assert_eq!(layout.attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(layout.attachments[1].format, DEPTH);
        assert_eq!(
            layout.attachments[1].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        assert_eq!(layout.dependencies.len(), 2);
        let incoming = layout.dependencies[0];
        assert_eq!(incoming.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(incoming.dst_subpass, 0);
        assert_eq!(incoming.src_stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert!(incoming.dst_stage_mask.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));

        let outgoing = layout.dependencies[1];
        assert_eq!(outgoing.src_subpass, 0);
        assert_eq!(outgoing.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(outgoing.dst_stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn dependencies_run_from_earlier_to_later_subpass() {
        let sink = RecordingSink::default();
        let layout = RenderPassBuilder::new(&sink, COLOR, DEPTH)
            .begin_subpass("geometry")
            .color_attachment(1)
            .depth_attachment(1)
            .end_subpass()
            .begin_subpass("lighting")
            .input_attachment(InputAttachmentFormat::Color)
            .input_attachment(InputAttachmentFormat::Depth)
            .color_attachment(1)
            .depend_on("geometry")
            .end_subpass()
            .finish();

        assert_eq!(layout.subpasses.len(), 2);
        assert_eq!(layout.subpasses[1].index, 1);
        // Attachment indices continue across subpasses.
        assert_eq!(layout.subpasses[1].input[0].attachment, 2);
        assert_eq!(layout.subpasses[1].color[0].attachment, 4);

        let inner = layout.dependencies[0];
        assert_eq!(inner.src_subpass, 0);
        assert_eq!(inner.dst_subpass, 1);
        assert!(inner.dst_access_mask.contains(vk::AccessFlags::INPUT_ATTACHMENT_READ));
        assert!(inner.src_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));

        let outgoing = layout.dependencies.last().unwrap();
        assert_eq!(outgoing.src_subpass, 1);
        assert_eq!(outgoing.dst_subpass, vk::SUBPASS_EXTERNAL);

        // Only the final output of the last subpass is presented.
        assert_eq!(layout.attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(layout.attachments[4].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn resolve_target_is_presented_instead_of_multisampled_color() {
        let sink = RecordingSink::default();
        let layout = RenderPassBuilder::new(&sink, COLOR, DEPTH)
            .begin_subpass("main")
            .color_attachment(4)
            .msaa_attachment()
            .end_subpass()
            .finish();

        assert_eq!(layout.attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(layout.attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(layout.attachments[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(layout.attachments[1].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(layout.subpasses[0].msaa.unwrap().attachment, 1);
    }

    #[test]
    fn unrelated_subpasses_get_no_inner_dependency() {
        let first = SubpassLayout {
            index: 0,
            depth: Some(vk::AttachmentReference::default()),
            ..Default::default()
        };
        let second = SubpassLayout {
            index: 1,
            color: vec![vk::AttachmentReference::default()],
            ..Default::default()
        };
        assert!(dependency_between(&first, &second).is_none());
    }
}
