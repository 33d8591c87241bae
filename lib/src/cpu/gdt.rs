use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const STACK_SIZE: usize = 4096 * 5;

#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub kernel_code_selector: SegmentSelector,
    pub kernel_data_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

/// TSS with the double-fault stack in IST slot 0 and the ring 0 stack.
pub fn task_state_segment(double_fault_stack_top: VirtAddr, kernel_stack_top: VirtAddr) -> TaskStateSegment {
    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = double_fault_stack_top;
    tss.privilege_stack_table[0] = kernel_stack_top;
    tss
}

/// Lays out the GDT. User data comes before user code, which is what `sysret` expects.
pub fn build(tss: &'static TaskStateSegment) -> (GlobalDescriptorTable, Selectors) {
    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code_selector = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data_selector = gdt.append(Descriptor::kernel_data_segment());
    let user_data_selector = gdt.append(Descriptor::user_data_segment());
    let user_code_selector = gdt.append(Descriptor::user_code_segment());
    let tss_selector = gdt.append(Descriptor::tss_segment(tss));

    (
        gdt,
        Selectors {
            kernel_code_selector,
            kernel_data_selector,
            user_data_selector,
            user_code_selector,
            tss_selector,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    static TSS: TaskStateSegment = TaskStateSegment::new();

    #[test]
    fn selectors_have_fixed_values() {
        let (_, selectors) = build(&TSS);

        assert_eq!(selectors.kernel_code_selector.0, 0x08);
        assert_eq!(selectors.kernel_data_selector.0, 0x10);
        assert_eq!(selectors.user_data_selector.0, 0x1b);
        assert_eq!(selectors.user_code_selector.0, 0x23);
        assert_eq!(selectors.tss_selector.0, 0x28);
    }

    #[test]
    fn tss_stacks() {
        let tss = task_state_segment(VirtAddr::new(0x9000), VirtAddr::new(0x5000));

        // The TSS is packed; copy the tables out before indexing.
        let (ist, privilege) = ({ tss.interrupt_stack_table }, { tss.privilege_stack_table });
        assert_eq!(ist[DOUBLE_FAULT_IST_INDEX as usize], VirtAddr::new(0x9000));
        assert_eq!(privilege[0], VirtAddr::new(0x5000));
        assert_eq!(ist[1], VirtAddr::zero());
    }
}
