mod device_mem;
mod exec_mem;

pub use device_mem::DeviceMem;
pub use exec_mem::ExecMem;
