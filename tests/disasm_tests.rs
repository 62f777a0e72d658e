use demu64::{disassemble, disassemble_range, Emulator, Register, CODE_BASE};

fn lines(code: &[u8], count: usize) -> Vec<String> {
    let emu = Emulator::new(code);
    disassemble(&emu.memory, CODE_BASE, count)
        .into_iter()
        .map(|d| d.mnemonic)
        .collect()
}

#[test]
fn decode_execute_roundtrip() {
    let code = [0xB8, 0x0A, 0x00, 0x00, 0x00];
    let mut emu = Emulator::new(&code);

    let listing = disassemble(&emu.memory, CODE_BASE, 1);
    assert_eq!(listing[0].mnemonic, "MOV EAX,0xA");
    assert_eq!(listing[0].address, CODE_BASE);
    assert_eq!(listing[0].length, 5);

    emu.step().unwrap();
    assert_eq!(emu.reg_read(Register::EAX), 0x0000_000A);
}

#[test]
fn listing_of_a_small_program() {
    let code = [
        0xB8, 0x07, 0x00, 0x00, 0x00, // mov eax, 7
        0x48, 0x01, 0xD8, // add rax, rbx
        0xF7, 0xF3, // div ebx
        0x74, 0x02, // je
        0xF4, // hlt
    ];
    assert_eq!(
        lines(&code, 5),
        vec![
            "MOV EAX,0x7",
            "ADD RAX,RBX",
            "DIV EBX",
            "JE 0x100E",
            "HLT",
        ]
    );
}

#[test]
fn pointer_expressions() {
    let code = [
        0x8B, 0x54, 0x98, 0x10, // mov edx, [rax+rbx*4+0x10]
        0x48, 0x8B, 0x45, 0xF8, // mov rax, [rbp-8]
        0x88, 0x0C, 0x25, 0x00, 0x00, 0x20, 0x00, // mov [0x200000], cl
    ];
    assert_eq!(
        lines(&code, 3),
        vec![
            "MOV EDX,DWORD PTR [rax+rbx*4+0x10]",
            "MOV RAX,QWORD PTR [rbp-0x8]",
            "MOV BYTE PTR [0x200000],CL",
        ]
    );
}

#[test]
fn group_opcodes_print_their_resolved_family() {
    let code = [
        0x83, 0xE8, 0x05, // sub eax, 5
        0xF7, 0xDB, // neg ebx
        0xFF, 0xD0, // call rax
        0xFF, 0x36, // push qword [rsi]
        0xC1, 0xE1, 0x1F, // shl ecx, 31
    ];
    assert_eq!(
        lines(&code, 5),
        vec![
            "SUB EAX,0x5",
            "NEG EBX",
            "CALL RAX",
            "PUSH QWORD PTR [rsi]",
            "SHL ECX,0x1F",
        ]
    );
}

#[test]
fn setcc_and_jrcxz() {
    let code = [
        0x0F, 0x94, 0xC0, // sete al
        0xE3, 0xFB, // jrcxz back
    ];
    assert_eq!(lines(&code, 2), vec!["SETE AL", "JRCXZ 0x1000"]);
}

#[test]
fn rip_relative_prints_symbolically() {
    let code = [0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
    assert_eq!(lines(&code, 1), vec!["MOV EAX,DWORD PTR [rip+0x10]"]);
}

#[test]
fn bad_bytes_yield_placeholder_lines() {
    // 0x0E has no meaning in 64-bit mode; the listing flows past it
    let code = [0x0E, 0x90, 0xF4];
    assert_eq!(lines(&code, 3), vec!["(bad)", "NOP", "HLT"]);
}

#[test]
fn range_walk_covers_the_segment() {
    let code = [0xB8, 0x0A, 0x00, 0x00, 0x00, 0x90, 0xF4];
    let emu = Emulator::new(&code);
    let listing = disassemble_range(&emu.memory, CODE_BASE, CODE_BASE + code.len() as u64);
    assert_eq!(listing.len(), 3);
    assert_eq!(listing[1].address, CODE_BASE + 5);
    let total: usize = listing.iter().map(|d| d.length).sum();
    assert_eq!(total, code.len());
}

#[test]
fn disassembly_does_not_disturb_execution() {
    let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xF4];
    let mut emu = Emulator::new(&code);

    let before = emu.cpu.clone();
    let _ = disassemble(&emu.memory, CODE_BASE, 2);
    assert_eq!(emu.cpu, before);
    assert_eq!(emu.flags, demu64::FlagSet::CLEAR);

    emu.step().unwrap();
    assert_eq!(emu.reg_read(Register::EAX), 0x2A);
}

#[test]
fn locating_the_instruction_at_a_checkpoint() {
    // the harness uses the listing to find which instruction sits at a
    // checkpoint address
    let code = [0xB8, 0x07, 0x00, 0x00, 0x00, 0x83, 0xC0, 0x03, 0xF4];
    let emu = Emulator::new(&code);
    let listing = disassemble_range(&emu.memory, CODE_BASE, CODE_BASE + code.len() as u64);
    let at = listing
        .iter()
        .find(|d| d.address == CODE_BASE + 5)
        .unwrap();
    assert_eq!(at.mnemonic, "ADD EAX,0x3");
}
