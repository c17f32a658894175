// Islet Classes - ISLISP Object System
//
// Class lattice rooted at <object>, generic functions with standard method
// combination, and instances. The class precedence list is computed by C3
// linearization at class-definition time and cached.

use crate::symbol::{SymbolId, SymbolTable};
use crate::types::NodeId;
use std::collections::HashMap;

/// Unique identifier for a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Unique identifier for a generic function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericId(pub u32);

/// Unique identifier for a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

/// A slot definition
#[derive(Debug, Clone)]
pub struct SlotDefinition {
    pub name: SymbolId,
    pub initarg: Option<SymbolId>,
    /// Unevaluated form, run at instance-creation time for unbound slots
    pub initform: Option<NodeId>,
    pub readers: Vec<SymbolId>,
    pub writers: Vec<SymbolId>,
    pub boundps: Vec<SymbolId>,
    pub index: usize,
}

/// A class definition
#[derive(Debug, Clone)]
pub struct Class {
    pub name: SymbolId,
    /// Direct superclasses, order significant
    pub supers: Vec<ClassId>,
    /// Class precedence list (computed, self first)
    pub cpl: Vec<ClassId>,
    pub direct_slots: Vec<SlotDefinition>,
    /// Effective slots (inherited + direct, re-indexed)
    pub slots: Vec<SlotDefinition>,
    pub direct_subclasses: Vec<ClassId>,
    pub instance_size: usize,
    pub abstractp: bool,
    pub builtin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodQualifier {
    Primary,
    Before,
    After,
    Around,
}

/// Method behavior: a user closure or a slot-access shim installed by
/// defclass slot options.
#[derive(Debug, Clone)]
pub enum MethodBody {
    Closure(u32),
    SlotReader(SymbolId),
    SlotWriter(SymbolId),
    SlotBoundp(SymbolId),
}

#[derive(Debug, Clone)]
pub struct Method {
    pub qualifier: MethodQualifier,
    /// One specializer per required parameter
    pub specializers: Vec<ClassId>,
    pub body: MethodBody,
    pub generic: GenericId,
}

#[derive(Debug, Clone)]
pub struct GenericFunction {
    pub name: SymbolId,
    pub required: usize,
    pub has_rest: bool,
    /// Indices into the required parameters, most significant first
    pub argument_precedence: Option<Vec<usize>>,
    pub methods: Vec<MethodId>,
}

/// An instance of a user-defined class. Slots may be unbound.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class: ClassId,
    pub slots: Vec<Option<NodeId>>,
}

/// The class/generic registry
pub struct ClassRegistry {
    classes: Vec<Class>,
    class_names: HashMap<SymbolId, ClassId>,
    generics: Vec<GenericFunction>,
    generic_names: HashMap<SymbolId, GenericId>,
    methods: Vec<Method>,
    instances: Vec<Instance>,
    /// Accessor generic name -> slot name, for setf places
    setf_accessors: HashMap<SymbolId, SymbolId>,

    // Built-in class ids (cached at bootstrap)
    pub object_class: ClassId,
    pub basic_array: ClassId,
    pub basic_vector: ClassId,
    pub general_vector: ClassId,
    pub string_class: ClassId,
    pub general_array: ClassId,
    pub built_in_class: ClassId,
    pub standard_class: ClassId,
    pub character_class: ClassId,
    pub function_class: ClassId,
    pub generic_function: ClassId,
    pub standard_generic_function: ClassId,
    pub list_class: ClassId,
    pub cons_class: ClassId,
    pub null_class: ClassId,
    pub number_class: ClassId,
    pub integer_class: ClassId,
    pub float_class: ClassId,
    pub symbol_class: ClassId,
    pub stream_class: ClassId,
    pub standard_object: ClassId,

    // Condition classes
    pub serious_condition: ClassId,
    pub error_class: ClassId,
    pub storage_exhausted: ClassId,
    pub simple_error: ClassId,
    pub domain_error: ClassId,
    pub arity_error: ClassId,
    pub undefined_entity: ClassId,
    pub unbound_variable: ClassId,
    pub undefined_function: ClassId,
    pub control_error: ClassId,
    pub program_error: ClassId,
    pub arithmetic_error: ClassId,
    pub division_by_zero: ClassId,
    pub floating_point_overflow: ClassId,
    pub floating_point_underflow: ClassId,
    pub parse_error: ClassId,
    pub stream_error: ClassId,
    pub end_of_stream: ClassId,
    pub class_error: ClassId,
    pub method_combination_error: ClassId,
}

impl ClassRegistry {
    pub fn new(symbols: &mut SymbolTable) -> Self {
        let mut reg = Self {
            classes: Vec::new(),
            class_names: HashMap::new(),
            generics: Vec::new(),
            generic_names: HashMap::new(),
            methods: Vec::new(),
            instances: Vec::new(),
            setf_accessors: HashMap::new(),
            object_class: ClassId(0),
            basic_array: ClassId(0),
            basic_vector: ClassId(0),
            general_vector: ClassId(0),
            string_class: ClassId(0),
            general_array: ClassId(0),
            built_in_class: ClassId(0),
            standard_class: ClassId(0),
            character_class: ClassId(0),
            function_class: ClassId(0),
            generic_function: ClassId(0),
            standard_generic_function: ClassId(0),
            list_class: ClassId(0),
            cons_class: ClassId(0),
            null_class: ClassId(0),
            number_class: ClassId(0),
            integer_class: ClassId(0),
            float_class: ClassId(0),
            symbol_class: ClassId(0),
            stream_class: ClassId(0),
            standard_object: ClassId(0),
            serious_condition: ClassId(0),
            error_class: ClassId(0),
            storage_exhausted: ClassId(0),
            simple_error: ClassId(0),
            domain_error: ClassId(0),
            arity_error: ClassId(0),
            undefined_entity: ClassId(0),
            unbound_variable: ClassId(0),
            undefined_function: ClassId(0),
            control_error: ClassId(0),
            program_error: ClassId(0),
            arithmetic_error: ClassId(0),
            division_by_zero: ClassId(0),
            floating_point_overflow: ClassId(0),
            floating_point_underflow: ClassId(0),
            parse_error: ClassId(0),
            stream_error: ClassId(0),
            end_of_stream: ClassId(0),
            class_error: ClassId(0),
            method_combination_error: ClassId(0),
        };

        // Standard hierarchy, leaves after their supers
        reg.object_class = reg.builtin(symbols, "<OBJECT>", &[]);
        let obj = reg.object_class;
        reg.basic_array = reg.builtin(symbols, "<BASIC-ARRAY>", &[obj]);
        reg.basic_vector = reg.builtin(symbols, "<BASIC-VECTOR>", &[reg.basic_array]);
        reg.general_vector = reg.builtin(symbols, "<GENERAL-VECTOR>", &[reg.basic_vector]);
        reg.string_class = reg.builtin(symbols, "<STRING>", &[reg.basic_vector]);
        reg.general_array = reg.builtin(symbols, "<GENERAL-ARRAY*>", &[reg.basic_array]);
        reg.built_in_class = reg.builtin(symbols, "<BUILT-IN-CLASS>", &[obj]);
        reg.standard_class = reg.builtin(symbols, "<STANDARD-CLASS>", &[obj]);
        reg.character_class = reg.builtin(symbols, "<CHARACTER>", &[obj]);
        reg.function_class = reg.builtin(symbols, "<FUNCTION>", &[obj]);
        reg.generic_function = reg.builtin(symbols, "<GENERIC-FUNCTION>", &[reg.function_class]);
        reg.standard_generic_function = reg.builtin(
            symbols,
            "<STANDARD-GENERIC-FUNCTION>",
            &[reg.generic_function],
        );
        reg.list_class = reg.builtin(symbols, "<LIST>", &[obj]);
        reg.cons_class = reg.builtin(symbols, "<CONS>", &[reg.list_class]);
        reg.symbol_class = reg.builtin(symbols, "<SYMBOL>", &[obj]);
        // NIL is both a list and the symbol named NIL
        reg.null_class = reg.builtin(symbols, "<NULL>", &[reg.symbol_class, reg.list_class]);
        reg.number_class = reg.builtin(symbols, "<NUMBER>", &[obj]);
        reg.integer_class = reg.builtin(symbols, "<INTEGER>", &[reg.number_class]);
        reg.float_class = reg.builtin(symbols, "<FLOAT>", &[reg.number_class]);
        reg.stream_class = reg.builtin(symbols, "<STREAM>", &[obj]);
        reg.standard_object = reg.builtin(symbols, "<STANDARD-OBJECT>", &[obj]);

        // Condition hierarchy. Condition classes are creatable with
        // `create`, unlike the value classes above.
        reg.serious_condition = reg.condition(symbols, "<SERIOUS-CONDITION>", &[obj], &[]);
        reg.error_class = reg.condition(symbols, "<ERROR>", &[reg.serious_condition], &[]);
        reg.storage_exhausted =
            reg.condition(symbols, "<STORAGE-EXHAUSTED>", &[reg.serious_condition], &[]);
        let err = reg.error_class;
        reg.simple_error = reg.condition(
            symbols,
            "<SIMPLE-ERROR>",
            &[err],
            &["FORMAT-STRING", "FORMAT-ARGUMENTS"],
        );
        reg.domain_error = reg.condition(
            symbols,
            "<DOMAIN-ERROR>",
            &[err],
            &["OBJECT", "EXPECTED-CLASS"],
        );
        reg.arity_error = reg.condition(symbols, "<ARITY-ERROR>", &[err], &["FORM"]);
        reg.undefined_entity = reg.condition(
            symbols,
            "<UNDEFINED-ENTITY>",
            &[err],
            &["NAME", "NAMESPACE"],
        );
        reg.unbound_variable =
            reg.condition(symbols, "<UNBOUND-VARIABLE>", &[reg.undefined_entity], &[]);
        reg.undefined_function =
            reg.condition(symbols, "<UNDEFINED-FUNCTION>", &[reg.undefined_entity], &[]);
        reg.control_error = reg.condition(symbols, "<CONTROL-ERROR>", &[err], &["NAME"]);
        reg.program_error = reg.condition(symbols, "<PROGRAM-ERROR>", &[err], &[]);
        reg.arithmetic_error = reg.condition(
            symbols,
            "<ARITHMETIC-ERROR>",
            &[err],
            &["OPERATION", "OPERANDS"],
        );
        reg.division_by_zero =
            reg.condition(symbols, "<DIVISION-BY-ZERO>", &[reg.arithmetic_error], &[]);
        reg.floating_point_overflow = reg.condition(
            symbols,
            "<FLOATING-POINT-OVERFLOW>",
            &[reg.arithmetic_error],
            &[],
        );
        reg.floating_point_underflow = reg.condition(
            symbols,
            "<FLOATING-POINT-UNDERFLOW>",
            &[reg.arithmetic_error],
            &[],
        );
        reg.parse_error = reg.condition(
            symbols,
            "<PARSE-ERROR>",
            &[err],
            &["STRING", "EXPECTED-CLASS"],
        );
        reg.stream_error = reg.condition(symbols, "<STREAM-ERROR>", &[err], &["STREAM"]);
        reg.end_of_stream = reg.condition(symbols, "<END-OF-STREAM>", &[reg.stream_error], &[]);
        reg.class_error = reg.condition(symbols, "<CLASS-ERROR>", &[err], &["NAME"]);
        reg.method_combination_error =
            reg.condition(symbols, "<METHOD-COMBINATION-ERROR>", &[err], &[]);

        reg
    }

    fn builtin(&mut self, symbols: &mut SymbolTable, name: &str, supers: &[ClassId]) -> ClassId {
        self.register_predefined(symbols, name, supers, &[], true)
    }

    fn condition(
        &mut self,
        symbols: &mut SymbolTable,
        name: &str,
        supers: &[ClassId],
        slot_names: &[&str],
    ) -> ClassId {
        self.register_predefined(symbols, name, supers, slot_names, false)
    }

    fn register_predefined(
        &mut self,
        symbols: &mut SymbolTable,
        name: &str,
        supers: &[ClassId],
        slot_names: &[&str],
        builtin: bool,
    ) -> ClassId {
        let name_sym = symbols.intern(name);
        let slots: Vec<SlotDefinition> = slot_names
            .iter()
            .enumerate()
            .map(|(i, n)| SlotDefinition {
                name: symbols.intern(n),
                initarg: Some(symbols.intern(n)),
                initform: None,
                readers: Vec::new(),
                writers: Vec::new(),
                boundps: Vec::new(),
                index: i,
            })
            .collect();
        // Bootstrap order guarantees supers exist; C3 cannot fail here.
        self.install_class(name_sym, supers.to_vec(), slots, false, builtin)
            .expect("predefined class hierarchy is consistent")
    }

    /// Register (or redefine) a class. Err means the superclass graph has
    /// no consistent C3 linearization.
    pub fn define_class(
        &mut self,
        name: SymbolId,
        supers: Vec<ClassId>,
        direct_slots: Vec<SlotDefinition>,
        abstractp: bool,
    ) -> Result<ClassId, ()> {
        let supers = if supers.is_empty() {
            vec![self.standard_object]
        } else {
            supers
        };
        self.install_class(name, supers, direct_slots, abstractp, false)
    }

    fn install_class(
        &mut self,
        name: SymbolId,
        supers: Vec<ClassId>,
        direct_slots: Vec<SlotDefinition>,
        abstractp: bool,
        builtin: bool,
    ) -> Result<ClassId, ()> {
        let existing = self.class_names.get(&name).copied();
        let id = existing.unwrap_or(ClassId(self.classes.len() as u32));

        let cpl = self.linearize(id, &supers)?;

        // Effective slots: inherited first (general to specific so the most
        // specific definition wins), then direct ones.
        let mut effective: Vec<SlotDefinition> = Vec::new();
        for &cid in cpl.iter().rev() {
            let source: Vec<SlotDefinition> = if cid == id {
                direct_slots.clone()
            } else {
                self.classes[cid.0 as usize].direct_slots.clone()
            };
            for slot in source {
                if let Some(pos) = effective.iter().position(|s| s.name == slot.name) {
                    effective[pos] = slot;
                } else {
                    effective.push(slot);
                }
            }
        }
        for (i, slot) in effective.iter_mut().enumerate() {
            slot.index = i;
        }
        let instance_size = effective.len();

        let old_supers = existing
            .map(|eid| self.classes[eid.0 as usize].supers.clone())
            .unwrap_or_default();
        let direct_subclasses = existing
            .map(|eid| self.classes[eid.0 as usize].direct_subclasses.clone())
            .unwrap_or_default();

        let class = Class {
            name,
            supers: supers.clone(),
            cpl,
            direct_slots,
            slots: effective,
            direct_subclasses,
            instance_size,
            abstractp,
            builtin,
        };

        if let Some(eid) = existing {
            self.classes[eid.0 as usize] = class;
        } else {
            self.classes.push(class);
            self.class_names.insert(name, id);
        }

        for old in old_supers {
            if !supers.contains(&old) {
                self.classes[old.0 as usize]
                    .direct_subclasses
                    .retain(|c| *c != id);
            }
        }
        for s in supers {
            let subs = &mut self.classes[s.0 as usize].direct_subclasses;
            if !subs.contains(&id) {
                subs.push(id);
            }
        }

        Ok(id)
    }

    /// C3 linearization of a class over its direct superclasses.
    fn linearize(&self, id: ClassId, supers: &[ClassId]) -> Result<Vec<ClassId>, ()> {
        let mut seqs: Vec<Vec<ClassId>> = supers
            .iter()
            .map(|s| self.classes[s.0 as usize].cpl.clone())
            .collect();
        seqs.push(supers.to_vec());

        let mut result = vec![id];
        loop {
            seqs.retain(|s| !s.is_empty());
            if seqs.is_empty() {
                return Ok(result);
            }
            let mut candidate = None;
            'heads: for seq in &seqs {
                let head = seq[0];
                for other in &seqs {
                    if other[1..].contains(&head) {
                        continue 'heads;
                    }
                }
                candidate = Some(head);
                break;
            }
            match candidate {
                Some(head) => {
                    result.push(head);
                    for seq in seqs.iter_mut() {
                        seq.retain(|&c| c != head);
                    }
                }
                None => return Err(()),
            }
        }
    }

    pub fn find_class(&self, name: SymbolId) -> Option<ClassId> {
        self.class_names.get(&name).copied()
    }

    pub fn get_class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0 as usize)
    }

    pub fn class_name(&self, id: ClassId) -> SymbolId {
        self.classes[id.0 as usize].name
    }

    /// Class identity is reference identity; subclass tests walk the CPL.
    pub fn subclass_of(&self, a: ClassId, b: ClassId) -> bool {
        self.classes[a.0 as usize].cpl.contains(&b)
    }

    pub fn cpl_position(&self, class: ClassId, ancestor: ClassId) -> Option<usize> {
        self.classes[class.0 as usize]
            .cpl
            .iter()
            .position(|&c| c == ancestor)
    }

    /// Effective slot index by name on a concrete class.
    pub fn slot_index(&self, class: ClassId, name: SymbolId) -> Option<usize> {
        self.classes[class.0 as usize]
            .slots
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.index)
    }

    pub fn register_setf_accessor(&mut self, accessor: SymbolId, slot: SymbolId) {
        self.setf_accessors.insert(accessor, slot);
    }

    pub fn setf_slot(&self, accessor: SymbolId) -> Option<SymbolId> {
        self.setf_accessors.get(&accessor).copied()
    }

    // -- Instances ----------------------------------------------------------

    pub fn create_instance(&mut self, class: ClassId) -> u32 {
        let size = self.classes[class.0 as usize].instance_size;
        let idx = self.instances.len() as u32;
        self.instances.push(Instance {
            class,
            slots: vec![None; size],
        });
        idx
    }

    pub fn get_instance(&self, idx: u32) -> Option<&Instance> {
        self.instances.get(idx as usize)
    }

    pub fn get_instance_mut(&mut self, idx: u32) -> Option<&mut Instance> {
        self.instances.get_mut(idx as usize)
    }

    // -- Generic functions --------------------------------------------------

    pub fn find_generic(&self, name: SymbolId) -> Option<GenericId> {
        self.generic_names.get(&name).copied()
    }

    pub fn define_generic(
        &mut self,
        name: SymbolId,
        required: usize,
        has_rest: bool,
        argument_precedence: Option<Vec<usize>>,
    ) -> GenericId {
        if let Some(id) = self.generic_names.get(&name).copied() {
            let gf = &mut self.generics[id.0 as usize];
            gf.required = required;
            gf.has_rest = has_rest;
            if argument_precedence.is_some() {
                gf.argument_precedence = argument_precedence;
            }
            return id;
        }
        let id = GenericId(self.generics.len() as u32);
        self.generics.push(GenericFunction {
            name,
            required,
            has_rest,
            argument_precedence,
            methods: Vec::new(),
        });
        self.generic_names.insert(name, id);
        id
    }

    pub fn get_generic(&self, id: GenericId) -> Option<&GenericFunction> {
        self.generics.get(id.0 as usize)
    }

    /// Add a method, replacing any existing one with the same qualifier and
    /// specializer list.
    pub fn add_method(
        &mut self,
        gf: GenericId,
        qualifier: MethodQualifier,
        specializers: Vec<ClassId>,
        body: MethodBody,
    ) -> MethodId {
        let existing = self.generics[gf.0 as usize]
            .methods
            .iter()
            .copied()
            .find(|&mid| {
                let m = &self.methods[mid.0 as usize];
                m.qualifier == qualifier && m.specializers == specializers
            });
        if let Some(mid) = existing {
            self.methods[mid.0 as usize].body = body;
            return mid;
        }
        let mid = MethodId(self.methods.len() as u32);
        self.methods.push(Method {
            qualifier,
            specializers,
            body,
            generic: gf,
        });
        self.generics[gf.0 as usize].methods.push(mid);
        mid
    }

    pub fn get_method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.0 as usize)
    }

    /// Methods whose every specializer appears in the corresponding
    /// argument's CPL.
    pub fn compute_applicable(&self, gf: GenericId, arg_classes: &[ClassId]) -> Vec<MethodId> {
        self.generics[gf.0 as usize]
            .methods
            .iter()
            .copied()
            .filter(|&mid| {
                let m = &self.methods[mid.0 as usize];
                m.specializers.len() == arg_classes.len()
                    && m.specializers
                        .iter()
                        .zip(arg_classes)
                        .all(|(&spec, &argc)| self.subclass_of(argc, spec))
            })
            .collect()
    }

    /// Sort applicable methods most-specific first, comparing CPL positions
    /// across parameters in argument-precedence order. Err carries an
    /// ambiguous pair (identical positions, same qualifier).
    pub fn sort_by_specificity(
        &self,
        methods: &mut [MethodId],
        arg_classes: &[ClassId],
        precedence: Option<&[usize]>,
    ) -> Result<(), (MethodId, MethodId)> {
        let order: Vec<usize> = match precedence {
            Some(p) => p.to_vec(),
            None => (0..arg_classes.len()).collect(),
        };
        let position_vec = |mid: MethodId| -> Vec<usize> {
            let m = &self.methods[mid.0 as usize];
            order
                .iter()
                .map(|&i| {
                    self.cpl_position(arg_classes[i], m.specializers[i])
                        .unwrap_or(usize::MAX)
                })
                .collect()
        };
        let keys: HashMap<MethodId, Vec<usize>> =
            methods.iter().map(|&m| (m, position_vec(m))).collect();
        for (i, &a) in methods.iter().enumerate() {
            for &b in &methods[i + 1..] {
                if keys[&a] == keys[&b]
                    && self.methods[a.0 as usize].qualifier
                        == self.methods[b.0 as usize].qualifier
                {
                    return Err((a, b));
                }
            }
        }
        methods.sort_by(|a, b| keys[a].cmp(&keys[b]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    fn registry() -> (ClassRegistry, SymbolTable) {
        let mut symbols = SymbolTable::new();
        let reg = ClassRegistry::new(&mut symbols);
        (reg, symbols)
    }

    #[test]
    fn test_builtin_hierarchy() {
        let (reg, _) = registry();
        assert!(reg.subclass_of(reg.cons_class, reg.list_class));
        assert!(reg.subclass_of(reg.null_class, reg.list_class));
        assert!(reg.subclass_of(reg.null_class, reg.symbol_class));
        assert!(reg.subclass_of(reg.string_class, reg.basic_array));
        assert!(reg.subclass_of(reg.division_by_zero, reg.serious_condition));
        assert!(!reg.subclass_of(reg.integer_class, reg.float_class));
    }

    #[test]
    fn test_c3_diamond() {
        let (mut reg, mut symbols) = registry();
        let a = reg
            .define_class(symbols.intern("<A>"), vec![], vec![], false)
            .unwrap();
        let b = reg
            .define_class(symbols.intern("<B>"), vec![a], vec![], false)
            .unwrap();
        let c = reg
            .define_class(symbols.intern("<C>"), vec![a], vec![], false)
            .unwrap();
        let d = reg
            .define_class(symbols.intern("<D>"), vec![b, c], vec![], false)
            .unwrap();
        let cpl = &reg.get_class(d).unwrap().cpl;
        // D B C A <standard-object> <object>
        assert_eq!(cpl[0], d);
        assert_eq!(cpl[1], b);
        assert_eq!(cpl[2], c);
        assert_eq!(cpl[3], a);
    }

    #[test]
    fn test_c3_inconsistent() {
        let (mut reg, mut symbols) = registry();
        let a = reg
            .define_class(symbols.intern("<A>"), vec![], vec![], false)
            .unwrap();
        let b = reg
            .define_class(symbols.intern("<B>"), vec![a], vec![], false)
            .unwrap();
        // Asking for A before B contradicts B's own linearization.
        let bad = reg.define_class(symbols.intern("<BAD>"), vec![a, b], vec![], false);
        assert!(bad.is_err());
    }

    #[test]
    fn test_slot_inheritance() {
        let (mut reg, mut symbols) = registry();
        let x = symbols.intern("X");
        let y = symbols.intern("Y");
        let slot = |name: SymbolId| SlotDefinition {
            name,
            initarg: None,
            initform: None,
            readers: Vec::new(),
            writers: Vec::new(),
            boundps: Vec::new(),
            index: 0,
        };
        let a = reg
            .define_class(symbols.intern("<A>"), vec![], vec![slot(x)], false)
            .unwrap();
        let b = reg
            .define_class(symbols.intern("<B>"), vec![a], vec![slot(y)], false)
            .unwrap();
        assert_eq!(reg.get_class(b).unwrap().instance_size, 2);
        assert!(reg.slot_index(b, x).is_some());
        assert!(reg.slot_index(b, y).is_some());
        assert_ne!(reg.slot_index(b, x), reg.slot_index(b, y));
    }

    #[test]
    fn test_method_sorting() {
        let (mut reg, mut symbols) = registry();
        let a = reg
            .define_class(symbols.intern("<A>"), vec![], vec![], false)
            .unwrap();
        let b = reg
            .define_class(symbols.intern("<B>"), vec![a], vec![], false)
            .unwrap();
        let gf = reg.define_generic(symbols.intern("F"), 1, false, None);
        let m_general = reg.add_method(gf, MethodQualifier::Primary, vec![a], MethodBody::Closure(0));
        let m_specific = reg.add_method(gf, MethodQualifier::Primary, vec![b], MethodBody::Closure(1));

        let mut applicable = reg.compute_applicable(gf, &[b]);
        assert_eq!(applicable.len(), 2);
        reg.sort_by_specificity(&mut applicable, &[b], None).unwrap();
        assert_eq!(applicable[0], m_specific);
        assert_eq!(applicable[1], m_general);

        // Only the general method applies to an <A>.
        let applicable_a = reg.compute_applicable(gf, &[a]);
        assert_eq!(applicable_a, vec![m_general]);
    }

    #[test]
    fn test_add_method_replaces_same_specializers() {
        let (mut reg, mut symbols) = registry();
        let a = reg
            .define_class(symbols.intern("<A>"), vec![], vec![], false)
            .unwrap();
        let gf = reg.define_generic(symbols.intern("F"), 1, false, None);
        let m1 = reg.add_method(gf, MethodQualifier::Primary, vec![a], MethodBody::Closure(0));
        let m2 = reg.add_method(gf, MethodQualifier::Primary, vec![a], MethodBody::Closure(9));
        assert_eq!(m1, m2);
        assert_eq!(reg.get_generic(gf).unwrap().methods.len(), 1);
    }
}
