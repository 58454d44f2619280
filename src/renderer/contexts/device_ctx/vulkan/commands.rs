use std::collections::VecDeque;
use ash::vk;
use crate::renderer::contexts::device_ctx::backend::DeviceResult;

/// Command buffers for the one queue, recycled once their submission has retired
pub struct CommandPool {
    pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    /// Command buffers with the submission serial they were submitted with, oldest first
    in_flight: VecDeque<(vk::CommandBuffer, u64)>,
}

impl CommandPool {
    pub fn new(
        device: &ash::Device,
        queue_family_index: u32,
    ) -> DeviceResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe {
            device.create_command_pool(&pool_info, None)?
        };

        Ok(Self {
            pool,
            free: Vec::new(),
            in_flight: VecDeque::new(),
        })
    }

    /// A command buffer ready for recording, reusing one whose work is done if possible
    pub fn acquire(
        &mut self,
        device: &ash::Device,
        completed_serial: u64,
    ) -> DeviceResult<vk::CommandBuffer> {
        while let Some(&(command_buffer, serial)) = self.in_flight.front() {
            if serial > completed_serial {
                break;
            }
            self.in_flight.pop_front();
            self.free.push(command_buffer);
        }

        let command_buffer = match self.free.pop() {
            Some(command_buffer) => {
                unsafe {
                    device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
                }
                command_buffer
            }
            None => {
                let command_buffer_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.pool)
                    .command_buffer_count(1)
                    .level(vk::CommandBufferLevel::PRIMARY);
                unsafe {
                    device.allocate_command_buffers(&command_buffer_info)?[0]
                }
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.begin_command_buffer(command_buffer, &begin_info)?;
        }

        Ok(command_buffer)
    }

    pub fn retire(&mut self, command_buffer: vk::CommandBuffer, serial: u64) {
        self.in_flight.push_back((command_buffer, serial));
    }

    /// Returns a command buffer that was never submitted
    pub fn give_back(&mut self, command_buffer: vk::CommandBuffer) {
        self.free.push(command_buffer);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// The device must be idle
    pub fn destroy(&mut self, device: &ash::Device) {
        let command_buffers = self.free
            .drain(..)
            .chain(self.in_flight.drain(..).map(|(command_buffer, _)| command_buffer))
            .collect::<Vec<_>>();
        unsafe {
            if !command_buffers.is_empty() {
                device.free_command_buffers(self.pool, &command_buffers);
            }
            device.destroy_command_pool(self.pool, None);
        }
    }
}
