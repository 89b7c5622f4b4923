use bytemuck::Pod;

use crate::renderer::device::{
    BufferKind, BufferRange, DrawElementsIndirectCommand, GpuDevice, IndexedDraw,
};
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::internal::arena::PersistentArena;

pub const MAX_MULTIDRAW_COMMANDS: usize = 8192;
/// Largest per-draw storage record any multi-draw program reads.
pub const MAX_ELEMENT_SIZE: u64 = 256;
pub const BUFFER_FACTOR: u32 = 3;
/// Instances a single command may draw (one per stereo eye). The draw-id
/// stream repeats every id this many times, so each instance of command `i`
/// reads id `i` and the shader derives the eye from the instance index.
pub const MAX_DRAW_INSTANCES: u32 = 2;

/// Base instance of the `index`-th command of a batch.
pub fn draw_base_instance(index: usize) -> u32 {
    index as u32 * MAX_DRAW_INSTANCES
}

const COMMAND_SIZE: u64 = std::mem::size_of::<DrawElementsIndirectCommand>() as u64;
/// Full-capacity batches the command arena holds per frame. Depth buckets
/// and every light's shadow passes share one region.
const COMMAND_BATCHES_PER_FRAME: u64 = 4;

/// Issues an uploaded batch. Without indirect first-instance support the
/// device would ignore `base_instance`, so the commands are replayed as
/// direct draws that still select their own draw id.
pub fn issue_multi_draw<D: GpuDevice>(
    device: &mut D,
    submission: &MultiDrawSubmission,
    commands: &[DrawElementsIndirectCommand],
    indirect_first_instance: bool,
) {
    if indirect_first_instance {
        device.multi_draw_indexed_indirect(submission.commands, submission.draw_count);
        return;
    }
    for command in commands {
        device.draw_indexed(&IndexedDraw {
            index_count: command.count,
            first_index: command.first_index,
            base_vertex: command.base_vertex as i32,
            instance_count: command.instance_count,
            first_instance: command.base_instance,
        });
    }
}

/// Where one multi-draw's records ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiDrawSubmission {
    pub storage: BufferRange,
    pub commands: BufferRange,
    pub draw_count: u32,
}

/// Buffers shared by every indirect multi-draw: the per-draw storage arena,
/// the indirect command arena and the static draw-id stream.
#[derive(Debug)]
pub struct MultiDrawBuffers {
    storage: PersistentArena,
    commands: PersistentArena,
    max_commands: usize,
    initialised: bool,
    rollovers: u64,
}

impl MultiDrawBuffers {
    pub fn new(max_commands: usize, storage_alignment: u32) -> Self {
        let max_commands = max_commands.max(1);
        Self {
            storage: PersistentArena::new(
                "MultiDrawStorage",
                BufferKind::Storage,
                max_commands as u64 * MAX_ELEMENT_SIZE,
                BUFFER_FACTOR,
                storage_alignment as u64,
            ),
            commands: PersistentArena::new(
                "MultiDrawCommands",
                BufferKind::Indirect,
                max_commands as u64 * COMMAND_SIZE * COMMAND_BATCHES_PER_FRAME,
                BUFFER_FACTOR,
                COMMAND_SIZE,
            ),
            max_commands,
            initialised: false,
            rollovers: 0,
        }
    }

    pub fn max_commands(&self) -> usize {
        self.max_commands
    }

    pub fn storage(&self) -> &PersistentArena {
        &self.storage
    }

    pub fn commands(&self) -> &PersistentArena {
        &self.commands
    }

    pub fn init<D: GpuDevice>(&mut self, device: &mut D) {
        if self.initialised {
            return;
        }
        log::info!(
            "Initializing multi-draw buffers for {} commands",
            self.max_commands
        );

        let draw_ids: Vec<u32> = (0..self.max_commands as u32)
            .flat_map(|id| std::iter::repeat(id).take(MAX_DRAW_INSTANCES as usize))
            .collect();
        let bytes: &[u8] = bytemuck::cast_slice(&draw_ids);
        device.create_buffer(BufferKind::DrawId, bytes.len() as u64);
        device.write_buffer(BufferKind::DrawId, 0, bytes);

        self.storage.init(device);
        self.commands.init(device);
        self.initialised = true;
    }

    pub fn shutdown<D: GpuDevice>(&mut self, device: &mut D) {
        if !self.initialised {
            return;
        }
        log::info!("Shutting down multi-draw buffers");
        self.storage.destroy(device);
        self.commands.destroy(device);
        device.destroy_buffer(BufferKind::DrawId);
        self.initialised = false;
    }

    /// Batches larger than the command capacity are a caller error.
    pub fn reserve_commands(&self, count: usize) -> RenderResult<()> {
        if count > self.max_commands {
            return Err(RenderError::CapacityExceeded {
                what: "multi-draw commands",
                requested: count,
                capacity: self.max_commands,
            });
        }
        Ok(())
    }

    /// Writes one batch's per-draw records and commands into this frame's
    /// regions. Returns `None` for an empty batch.
    ///
    /// A batch that no longer fits the current regions submits the work
    /// recorded so far and continues in the next regions.
    pub fn upload<D: GpuDevice, T: Pod>(
        &mut self,
        device: &mut D,
        draw_data: &[T],
        commands: &[DrawElementsIndirectCommand],
    ) -> RenderResult<Option<MultiDrawSubmission>> {
        self.reserve_commands(commands.len())?;
        if commands.is_empty() {
            return Ok(None);
        }

        let storage_size = std::mem::size_of_val(draw_data) as u64;
        let command_size = commands.len() as u64 * COMMAND_SIZE;
        if storage_size > self.storage.available() || command_size > self.commands.available() {
            self.roll_over(device);
        }

        let storage = self.storage.reserve(storage_size)?;
        let written = self.storage.write(device, &storage, draw_data)?;
        self.storage.mark_used(storage, written)?;

        let reserved = self.commands.reserve(command_size)?;
        let written_commands = self.commands.write(device, &reserved, commands)?;
        self.commands.mark_used(reserved, written_commands)?;

        Ok(Some(MultiDrawSubmission {
            storage: storage.range(written),
            commands: reserved.range(written_commands),
            draw_count: commands.len() as u32,
        }))
    }

    pub fn switch_frame(&mut self) {
        self.storage.switch_frame();
        self.commands.switch_frame();
    }

    /// Mid-frame region switches since init.
    pub fn rollovers(&self) -> u64 {
        self.rollovers
    }

    fn roll_over<D: GpuDevice>(&mut self, device: &mut D) {
        log::debug!(
            "Multi-draw regions full ({} storage / {} command bytes used), submitting early",
            self.storage.used(),
            self.commands.used()
        );
        device.submit();
        self.switch_frame();
        self.rollovers += 1;
    }
}
