use lazy_static::lazy_static;
use libkestrel::{
    interrupts::{
        handler_if_available, Dispatch, ExceptionInfo, HandlerRegistry, InterruptContext,
        InterruptFrame, InterruptHandler, RegisterError, BREAKPOINT_VECTOR, PAGE_FAULT_VECTOR,
    },
    memory::address::VirtualAddress,
};
use log::{debug, info, trace};
use spinning_top::Spinlock;
use x86_64::{
    instructions::interrupts::without_interrupts,
    registers::{control::Cr2, rflags::RFlags},
    set_general_handler,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    VirtAddr,
};

use super::{gdt::DOUBLE_FAULT_IST_INDEX, pic};

pub static INTERRUPT_HANDLERS: Spinlock<HandlerRegistry> = Spinlock::new(HandlerRegistry::new());

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);

        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }

        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault
            .set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point
            .set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        idt.cp_protection_exception
            .set_handler_fn(cp_protection_handler);
        idt.hv_injection_exception
            .set_handler_fn(hv_injection_handler);
        idt.vmm_communication_exception
            .set_handler_fn(vmm_communication_handler);
        idt.security_exception.set_handler_fn(security_handler);

        // PIC lines and every software vector share one entry; it tells them apart.
        set_general_handler!(&mut idt, general_handler, 32..=255);
        idt
    };
}

pub fn init() {
    IDT.load();
    debug!("IDT loaded");
}

pub fn register_handler(vector: usize, handler: InterruptHandler) -> Result<(), RegisterError> {
    without_interrupts(|| INTERRUPT_HANDLERS.lock().register_handler(vector, handler))
}

pub fn replace_handler(
    vector: usize,
    handler: InterruptHandler,
) -> Result<Option<InterruptHandler>, RegisterError> {
    without_interrupts(|| INTERRUPT_HANDLERS.lock().replace_handler(vector, handler))
}

pub fn unregister_handler(vector: usize) -> Result<Option<InterruptHandler>, RegisterError> {
    without_interrupts(|| INTERRUPT_HANDLERS.lock().unregister_handler(vector))
}

fn snapshot(stack_frame: &InterruptStackFrame) -> InterruptFrame {
    InterruptFrame {
        instruction_pointer: stack_frame.instruction_pointer.as_u64(),
        code_segment: stack_frame.code_segment.0 as u64,
        cpu_flags: stack_frame.cpu_flags.bits(),
        stack_pointer: stack_frame.stack_pointer.as_u64(),
        stack_segment: stack_frame.stack_segment.0 as u64,
    }
}

/// Runs the registered handler. The lock is dropped before the call so handlers may
/// register other handlers. An NMI or exception landing while the table is held never
/// spins on it; the vector is treated as unhandled instead.
fn run_handler(context: &mut InterruptContext) -> Dispatch {
    let handler = handler_if_available(INTERRUPT_HANDLERS.try_lock(), context.vector);
    libkestrel::interrupts::dispatch(handler, context)
}

/// Dispatches an exception and applies the default action when nobody handled it.
fn handle_exception(
    vector: u8,
    stack_frame: &mut InterruptStackFrame,
    error_code: Option<u64>,
    fault_address: Option<VirtualAddress>,
) {
    let before = snapshot(stack_frame);
    let mut context = InterruptContext {
        vector,
        frame: before,
        error_code,
        fault_address,
    };

    match run_handler(&mut context) {
        Dispatch::Handled => {
            if context.frame != before {
                let frame = context.frame;
                unsafe {
                    stack_frame.as_mut().update(|value| {
                        value.instruction_pointer = VirtAddr::new(frame.instruction_pointer);
                        value.stack_pointer = VirtAddr::new(frame.stack_pointer);
                        value.cpu_flags = RFlags::from_bits_truncate(frame.cpu_flags);
                    });
                }
            }
        }
        _ if vector == BREAKPOINT_VECTOR => {
            info!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
        }
        _ => panic!(
            "EXCEPTION: {}\n{:#?}",
            ExceptionInfo::from(&context),
            stack_frame
        ),
    }
}

fn general_handler(stack_frame: InterruptStackFrame, index: u8, _error_code: Option<u64>) {
    if let Some(line) = pic::line_for_vector(index) {
        return handle_irq(line, index, stack_frame);
    }

    let mut context = InterruptContext::new(index, snapshot(&stack_frame));
    if run_handler(&mut context) != Dispatch::Handled {
        panic!("Unhandled interrupt {:#x}\n{:#?}", index, stack_frame);
    }
}

fn handle_irq(line: u8, vector: u8, stack_frame: InterruptStackFrame) {
    if (line == 7 || line == 15) && pic::filter_spurious(line) {
        trace!("Spurious IRQ {}", line);
        return;
    }

    let mut context = InterruptContext::new(vector, snapshot(&stack_frame));
    if run_handler(&mut context) != Dispatch::Handled {
        trace!("IRQ {} not handled", line);
    }
    pic::end_of_interrupt(line);
}

macro_rules! exception {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(mut stack_frame: InterruptStackFrame) {
            handle_exception($vector, &mut stack_frame, None, None);
        }
    };
    ($name:ident, $vector:expr, error_code) => {
        extern "x86-interrupt" fn $name(mut stack_frame: InterruptStackFrame, error_code: u64) {
            handle_exception($vector, &mut stack_frame, Some(error_code), None);
        }
    };
}

exception!(divide_error_handler, 0);
exception!(debug_handler, 1);
exception!(nmi_handler, 2);
exception!(breakpoint_handler, 3);
exception!(overflow_handler, 4);
exception!(bound_range_handler, 5);
exception!(invalid_opcode_handler, 6);
exception!(device_not_available_handler, 7);
exception!(invalid_tss_handler, 10, error_code);
exception!(segment_not_present_handler, 11, error_code);
exception!(stack_segment_fault_handler, 12, error_code);
exception!(general_protection_fault_handler, 13, error_code);
exception!(x87_floating_point_handler, 16);
exception!(alignment_check_handler, 17, error_code);
exception!(simd_floating_point_handler, 19);
exception!(virtualization_handler, 20);
exception!(cp_protection_handler, 21, error_code);
exception!(hv_injection_handler, 28);
exception!(vmm_communication_handler, 29, error_code);
exception!(security_handler, 30, error_code);

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "EXCEPTION: DOUBLE FAULT\nError Code: {}\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    mut stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let address = VirtualAddress::new(Cr2::read_raw() as usize);
    handle_exception(
        PAGE_FAULT_VECTOR,
        &mut stack_frame,
        Some(error_code.bits()),
        Some(address),
    );
}
