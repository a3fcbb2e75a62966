//! Probe driver
//!
//! Walks `Program → Probe → AttachPoint`, expands wildcards through the
//! external resolver, and emits one function per concrete match (and per
//! USDT location). Section names are `s_<probefull>_<index>` with a
//! monotonic per-probe-name index; that string is the loader's attachment
//! key. Async action counters are snapshotted before expansion and
//! restored for every match so each program's argument tables stay
//! compact.

use super::context::{CodeGen, CodeGenError, Result};
use crate::ast::{erase_prefix, Probe, ProbeType, Program};
use inkwell::values::FunctionValue;
use tracing::{debug, info};

#[derive(Clone, Copy)]
struct IdSnapshot {
    printf_id: u64,
    system_id: u64,
    cat_id: u64,
    time_id: u64,
    strftime_id: u64,
    join_id: u64,
    non_map_print_id: u64,
    helper_error_id: u64,
}

impl<'a, 'ctx> CodeGen<'a, 'ctx> {
    /// Lower the whole program: one emitted function per probe instance.
    pub fn generate(&mut self, program: &Program) -> Result<()> {
        info!("generating {} probes", program.probes.len());
        for probe in &program.probes {
            self.compile_probe(probe)?;
        }
        Ok(())
    }

    fn snapshot_ids(&self) -> IdSnapshot {
        IdSnapshot {
            printf_id: self.printf_id,
            system_id: self.system_id,
            cat_id: self.cat_id,
            time_id: self.time_id,
            strftime_id: self.strftime_id,
            join_id: self.join_id,
            non_map_print_id: self.non_map_print_id,
            helper_error_id: self.helper_error_id,
        }
    }

    fn restore_ids(&mut self, snapshot: IdSnapshot) {
        self.printf_id = snapshot.printf_id;
        self.system_id = snapshot.system_id;
        self.cat_id = snapshot.cat_id;
        self.time_id = snapshot.time_id;
        self.strftime_id = snapshot.strftime_id;
        self.join_id = snapshot.join_id;
        self.non_map_print_id = snapshot.non_map_print_id;
        self.helper_error_id = snapshot.helper_error_id;
    }

    fn compile_probe(&mut self, probe: &Probe) -> Result<()> {
        let mut probe = probe.clone();

        // USDT argument encodings differ per location, so those probes
        // always expand
        if probe
            .attach_points
            .first()
            .map(|ap| ap.probe_type() == ProbeType::Usdt)
            .unwrap_or(false)
        {
            probe.need_expansion = true;
        }

        if !probe.need_expansion {
            // one program serves every wildcard match
            self.probefull = probe.name();
            self.current_attach_point = probe.attach_points.first().cloned();
            let section_base = self.probefull.clone();
            self.generate_program(&probe, &section_base)?;
            self.current_attach_point = None;
            return Ok(());
        }

        // per-match programs: counters restart from the same baseline for
        // every match
        let snapshot = self.snapshot_ids();

        for attach_point in &probe.attach_points {
            let mut ap = attach_point.clone();

            let matches: Vec<String> = match ap.probe_type() {
                ProbeType::Begin | ProbeType::End => vec![ap.provider.clone()],
                _ => self.resolver.find_wildcard_matches(&ap),
            };
            debug!("attach point {} expands to {} matches", ap.name(), matches.len());

            self.tracepoint_struct.clear();
            for matched in matches {
                self.restore_ids(snapshot);

                if ap.probe_type() == ProbeType::Usdt {
                    // match carries target:ns:func; the attach point takes
                    // the resolved location so probefull names this match
                    let mut func_id = matched.clone();
                    let target = erase_prefix(&mut func_id);
                    let ns = erase_prefix(&mut func_id);
                    let orig_target = std::mem::replace(&mut ap.target, target);
                    let orig_ns = std::mem::replace(&mut ap.ns, ns);

                    self.probefull = ap.name_with_func(&func_id);
                    let usdt = self
                        .resolver
                        .find_usdt(self.metadata.pid, &ap.target, &ap.ns, &func_id)
                        .ok_or_else(|| {
                            CodeGenError::SymbolResolutionFailed(format!(
                                "failed to find usdt probe: {}",
                                self.probefull
                            ))
                        })?;
                    let num_locations = usdt.num_locations;
                    ap.usdt = Some(usdt);

                    // a probe inlined into several call sites needs one
                    // program per location: argument encodings differ
                    self.current_usdt_location_index = 0;
                    for loc in 0..num_locations {
                        self.restore_ids(snapshot);
                        let section_base = format!("{}_loc{loc}", self.probefull);
                        self.current_attach_point = Some(ap.clone());
                        self.generate_program(&probe, &section_base)?;
                        self.current_usdt_location_index += 1;
                    }

                    ap.target = orig_target;
                    ap.ns = orig_ns;
                    ap.usdt = None;
                } else {
                    self.probefull = match ap.probe_type() {
                        ProbeType::Begin | ProbeType::End => ap.provider.clone(),
                        ProbeType::Tracepoint | ProbeType::Uprobe | ProbeType::Uretprobe => {
                            // matches carry both the category/target and
                            // the function name
                            let mut func = matched.clone();
                            let category = erase_prefix(&mut func);
                            if ap.probe_type() == ProbeType::Tracepoint {
                                self.tracepoint_struct =
                                    tracepoint_struct_name(&category, &func);
                            }
                            ap.name_with_target_func(&category, &func)
                        }
                        _ => ap.name_with_func(&matched),
                    };
                    self.current_attach_point = Some(ap.clone());
                    let section_base = self.probefull.clone();
                    self.generate_program(&probe, &section_base)?;
                }
            }
        }
        self.current_attach_point = None;
        Ok(())
    }

    /// Emit one program: `i64 f(ptr ctx)` in section
    /// `s_<section_base>_<index>`, predicate first, then the body, then a
    /// zero return.
    fn generate_program(&mut self, probe: &Probe, section_base: &str) -> Result<FunctionValue<'ctx>> {
        let index = self.next_index_for_probe(&probe.name());
        let section = section_name(section_base, index);
        info!("emitting program {}", section);

        let i64t = self.context.i64_type();
        let ptr_ty = self.context.ptr_type(inkwell::AddressSpace::default());
        let fn_type = i64t.fn_type(&[ptr_ty.into()], false);
        let func = self.module.add_function(section_base, fn_type, None);
        func.set_section(Some(&section));

        let entry = self.context.append_basic_block(func, "entry");
        self.builder.position_at_end(entry);
        self.ctx_param = Some(
            func.get_first_param()
                .ok_or_else(|| CodeGenError::InternalBug("program has no context".to_string()))?
                .into_pointer_value(),
        );

        if let Some(pred) = &probe.pred {
            self.compile_predicate(pred)?;
        }
        self.variables.clear();
        for stmt in &probe.stmts {
            self.compile_statement(stmt)?;
        }
        self.builder
            .build_return(Some(&i64t.const_zero()))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.ctx_param = None;
        Ok(func)
    }

    fn next_index_for_probe(&mut self, probe_name: &str) -> u32 {
        let counter = self
            .next_probe_index
            .entry(probe_name.to_string())
            .or_insert(1);
        let index = *counter;
        *counter += 1;
        index
    }
}

fn section_name(probe_name: &str, index: u32) -> String {
    format!("s_{probe_name}_{index}")
}

/// Struct name the analyzer registers for a tracepoint's format record.
pub(crate) fn tracepoint_struct_name(category: &str, event: &str) -> String {
    format!("_tracepoint_{category}_{event}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_name() {
        assert_eq!(section_name("kprobe:do_nanosleep", 1), "s_kprobe:do_nanosleep_1");
        assert_eq!(
            section_name("usdt:libfoo:probe1_loc0", 1),
            "s_usdt:libfoo:probe1_loc0_1"
        );
    }

    #[test]
    fn test_tracepoint_struct_name() {
        assert_eq!(
            tracepoint_struct_name("syscalls", "sys_enter_open"),
            "_tracepoint_syscalls_sys_enter_open"
        );
    }
}
