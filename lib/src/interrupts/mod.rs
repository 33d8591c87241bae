//! Interrupt vectors, handler contexts and dispatch.

use core::fmt::{self, Display, Formatter};

use crate::memory::address::VirtualAddress;

pub mod pic;
pub mod registry;

pub use registry::{handler_if_available, HandlerRegistry, RegisterError};

pub const VECTOR_COUNT: usize = 256;
/// Vectors below this one are CPU exceptions.
pub const EXCEPTION_VECTORS: u8 = 32;

pub const BREAKPOINT_VECTOR: u8 = 3;
pub const DOUBLE_FAULT_VECTOR: u8 = 8;
pub const PAGE_FAULT_VECTOR: u8 = 14;
pub const MACHINE_CHECK_VECTOR: u8 = 18;

pub const PIC_MASTER_OFFSET: u8 = 32;
pub const PIC_SLAVE_OFFSET: u8 = PIC_MASTER_OFFSET + 8;
pub const TIMER_LINE: u8 = 0;

pub const fn is_exception(vector: u8) -> bool {
    vector < EXCEPTION_VECTORS
}

pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "Divide Error",
        1 => "Debug Exception",
        2 => "NMI Interrupt",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "BOUND Range Exceeded",
        6 => "Invalid Opcode",
        7 => "Device Not Available",
        8 => "Double Fault",
        9 => "Coprocessor Segment Overrun",
        10 => "Invalid TSS",
        11 => "Segment Not Present",
        12 => "Stack Fault",
        13 => "General Protection",
        14 => "Page Fault",
        16 => "x87 FPU Floating-Point Error",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD Floating-Point Exception",
        20 => "Virtualization Exception",
        21 => "Control Protection Exception",
        28 => "Hypervisor Injection Exception",
        29 => "VMM Communication Exception",
        30 => "Security Exception",
        15 | 22..=31 => "Reserved",
        _ => "Unknown Exception",
    }
}

/// Snapshot of what the CPU pushed on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptFrame {
    pub instruction_pointer: u64,
    pub code_segment: u64,
    pub cpu_flags: u64,
    pub stack_pointer: u64,
    pub stack_segment: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub vector: u8,
    pub frame: InterruptFrame,
    pub error_code: Option<u64>,
    /// CR2 at entry, only for page faults
    pub fault_address: Option<VirtualAddress>,
}

impl InterruptContext {
    pub fn new(vector: u8, frame: InterruptFrame) -> Self {
        Self {
            vector,
            frame,
            error_code: None,
            fault_address: None,
        }
    }

    pub fn with_error_code(mut self, error_code: u64) -> Self {
        self.error_code = Some(error_code);
        self
    }

    pub fn with_fault_address(mut self, address: VirtualAddress) -> Self {
        self.fault_address = Some(address);
        self
    }

    pub fn is_exception(&self) -> bool {
        is_exception(self.vector)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Handled,
    /// The handler could not deal with the interrupt; the default action applies.
    Escalate,
}

pub type InterruptHandler = fn(&mut InterruptContext) -> HandlerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Escalated,
    Unhandled,
}

impl Dispatch {
    /// Exceptions that were not handled bring the kernel down.
    pub fn is_fatal_for(self, vector: u8) -> bool {
        self != Dispatch::Handled && is_exception(vector)
    }
}

/// Runs `handler`, if any, against the context.
pub fn dispatch(handler: Option<InterruptHandler>, context: &mut InterruptContext) -> Dispatch {
    match handler {
        None => Dispatch::Unhandled,
        Some(handler) => match handler(context) {
            HandlerResult::Handled => Dispatch::Handled,
            HandlerResult::Escalate => Dispatch::Escalated,
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    pub vector: u8,
    pub error_code: Option<u64>,
    pub fault_address: Option<VirtualAddress>,
    pub frame: InterruptFrame,
}

impl From<&InterruptContext> for ExceptionInfo {
    fn from(context: &InterruptContext) -> Self {
        Self {
            vector: context.vector,
            error_code: context.error_code,
            fault_address: context.fault_address,
            frame: context.frame,
        }
    }
}

impl Display for ExceptionInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (vector: {}, rip: {:#x}",
            exception_name(self.vector),
            self.vector,
            self.frame.instruction_pointer
        )?;
        if let Some(code) = self.error_code {
            write!(f, ", error_code: {:#x}", code)?;
        }
        if let Some(addr) = self.fault_address {
            write!(f, ", cr2: {:#x}", addr)?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skip_instruction(context: &mut InterruptContext) -> HandlerResult {
        context.frame.instruction_pointer += 2;
        HandlerResult::Handled
    }

    fn give_up(_: &mut InterruptContext) -> HandlerResult {
        HandlerResult::Escalate
    }

    #[test]
    fn dispatch_outcomes() {
        let mut context = InterruptContext::new(6, InterruptFrame::default());

        assert_eq!(dispatch(None, &mut context), Dispatch::Unhandled);
        assert_eq!(dispatch(Some(give_up), &mut context), Dispatch::Escalated);
        assert_eq!(
            dispatch(Some(skip_instruction), &mut context),
            Dispatch::Handled
        );
        assert_eq!(context.frame.instruction_pointer, 2);
    }

    #[test]
    fn only_unhandled_exceptions_are_fatal() {
        assert!(Dispatch::Unhandled.is_fatal_for(13));
        assert!(Dispatch::Escalated.is_fatal_for(PAGE_FAULT_VECTOR));
        assert!(!Dispatch::Handled.is_fatal_for(13));
        assert!(!Dispatch::Unhandled.is_fatal_for(PIC_MASTER_OFFSET));
    }

    #[test]
    fn exception_info_names_the_vector() {
        let context = InterruptContext::new(PAGE_FAULT_VECTOR, InterruptFrame::default())
            .with_error_code(0x2)
            .with_fault_address(VirtualAddress::new(0xdead_b000));
        let info = ExceptionInfo::from(&context);

        let rendered = format!("{}", info);
        assert!(rendered.starts_with("Page Fault (vector: 14"));
        assert!(rendered.contains("cr2: 0xdeadb000"));
        assert_eq!(exception_name(15), "Reserved");
    }
}
